//! Signing session: stage the build artifacts, run the signer, assemble the
//! signed image.
//!
//! The signer is pluggable through the [`Signer`] trait. [`ExternalSigner`]
//! runs a signing executable and waits, with a bounded timeout, for the
//! signature file it leaves behind; [`SignatureFileSigner`] consumes a
//! signature that already exists.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::time::Instant;

use crate::assemble::{
    ensure_exists, signed_output_path, write_atomic, SignedImageAssembler, SIGNED_SUFFIX,
};
use crate::config::{expand_bin, SignerConfig, BIN_PLACEHOLDER};
use crate::metadata::MetadataHeader;
use crate::record::LineEnding;
use crate::signature::read_signature_lines;
use crate::{HexSignError, Result};

/// Default signature artifact location, next to the signed binary.
pub const DEFAULT_SIGNATURE_FILE: &str = "{bin}.sig";

// Floor for the artifact poll period.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Result of waiting for a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningOutcome {
    /// Signature lines (32 hex digits each).
    SignatureReady(Vec<String>),
    /// No signature appeared within `waited`.
    SigningTimedOut { waited: Duration },
}

/// Produces the signature of a firmware binary.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, binary: &Path) -> Result<SigningOutcome>;
}

/// Poll for `path` every `poll_interval` until it exists or `timeout`
/// elapses, then read it as signature lines.
///
/// Dropping the returned future cancels the wait.
pub async fn wait_for_artifact(
    path: &Path,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<SigningOutcome> {
    let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
    let deadline = Instant::now() + timeout;
    loop {
        if tokio::fs::try_exists(path).await? {
            let data = tokio::fs::read(path).await?;
            return Ok(SigningOutcome::SignatureReady(read_signature_lines(
                &data[..],
            )?));
        }
        if Instant::now() >= deadline {
            return Ok(SigningOutcome::SigningTimedOut { waited: timeout });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Runs an external signing program.
///
/// Arguments and the signature path may contain `{bin}`, replaced by the
/// path of the binary being signed.
#[derive(Debug, Clone)]
pub struct ExternalSigner {
    program: String,
    args: Vec<String>,
    signature_file: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl ExternalSigner {
    pub fn new(program: impl Into<String>) -> Self {
        let defaults = SignerConfig::default();
        Self {
            program: program.into(),
            args: vec![BIN_PLACEHOLDER.to_string()],
            signature_file: DEFAULT_SIGNATURE_FILE.to_string(),
            poll_interval: defaults.poll_interval(),
            timeout: defaults.timeout(),
        }
    }

    /// Build from the `[signer]` config section; `program` must be set.
    pub fn from_config(cfg: &SignerConfig) -> Result<Self> {
        let program = cfg
            .program
            .clone()
            .ok_or_else(|| HexSignError::Config("signer program is not set".into()))?;
        let mut signer = Self::new(program)
            .poll_interval(cfg.poll_interval())
            .timeout(cfg.timeout());
        if !cfg.args.is_empty() {
            signer.args = cfg.args.clone();
        }
        if let Some(ref f) = cfg.signature_file {
            signer.signature_file = f.clone();
        }
        Ok(signer)
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn signature_file(mut self, template: impl Into<String>) -> Self {
        self.signature_file = template.into();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Signer for ExternalSigner {
    async fn sign(&self, binary: &Path) -> Result<SigningOutcome> {
        let sig_path = PathBuf::from(expand_bin(&self.signature_file, binary));
        // A signature left over from an earlier run must not be mistaken for
        // this one.
        if tokio::fs::try_exists(&sig_path).await? {
            debug!("removing stale signature {}", sig_path.display());
            tokio::fs::remove_file(&sig_path).await?;
        }

        let args: Vec<String> = self.args.iter().map(|a| expand_bin(a, binary)).collect();
        info!("running signer: {} {}", self.program, args.join(" "));

        let start = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HexSignError::SignerFailed(format!("cannot run '{}': {e}", self.program))
            })?;

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    "signer '{}' still running after {:?}, killing it",
                    self.program, self.timeout
                );
                if let Err(e) = child.kill().await {
                    warn!("failed to kill signer '{}': {e}", self.program);
                }
                return Ok(SigningOutcome::SigningTimedOut {
                    waited: self.timeout,
                });
            }
        };
        if !status.success() {
            return Err(HexSignError::SignerFailed(format!(
                "'{}' exited with {status}",
                self.program
            )));
        }

        let remaining = self.timeout.saturating_sub(start.elapsed());
        match wait_for_artifact(&sig_path, self.poll_interval, remaining).await? {
            SigningOutcome::SigningTimedOut { .. } => Ok(SigningOutcome::SigningTimedOut {
                waited: self.timeout,
            }),
            ready => Ok(ready),
        }
    }
}

/// Uses a signature file produced ahead of time.
#[derive(Debug, Clone)]
pub struct SignatureFileSigner {
    path: PathBuf,
}

impl SignatureFileSigner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Signer for SignatureFileSigner {
    async fn sign(&self, _binary: &Path) -> Result<SigningOutcome> {
        ensure_exists(&self.path, "signature")?;
        let data = tokio::fs::read(&self.path).await?;
        Ok(SigningOutcome::SignatureReady(read_signature_lines(
            &data[..],
        )?))
    }
}

/// Inputs of one signing run.
#[derive(Debug, Clone)]
pub struct SignParams {
    /// Intel HEX image to sign.
    pub hex_file: PathBuf,
    /// Raw binary handed to the signer.
    pub bin_file: PathBuf,
    /// Directory the build artifacts are staged into.
    pub out_dir: PathBuf,
    pub metadata: MetadataHeader,
    pub line_ending: LineEnding,
    /// Appended to `hex_file` to name the signed image.
    pub suffix: String,
}

impl SignParams {
    pub fn new(
        hex_file: impl Into<PathBuf>,
        bin_file: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        metadata: MetadataHeader,
    ) -> Self {
        Self {
            hex_file: hex_file.into(),
            bin_file: bin_file.into(),
            out_dir: out_dir.into(),
            metadata,
            line_ending: LineEnding::default(),
            suffix: SIGNED_SUFFIX.to_string(),
        }
    }

    /// Paths for a project laid out as
    /// `<root>/Projects/<name>/uVision/Objects/<name>.{hex,bin}`, staged into
    /// `<root>/out/Projects/<name>`.
    pub fn for_project(root: impl AsRef<Path>, image_name: &str, metadata: MetadataHeader) -> Self {
        let root = root.as_ref();
        let objects = root
            .join("Projects")
            .join(image_name)
            .join("uVision")
            .join("Objects");
        Self::new(
            objects.join(format!("{image_name}.hex")),
            objects.join(format!("{image_name}.bin")),
            root.join("out").join("Projects").join(image_name),
            metadata,
        )
    }

    /// Where the signed image is written.
    pub fn output_path(&self) -> PathBuf {
        signed_output_path(&self.hex_file, &self.suffix)
    }
}

/// One end-to-end signing run.
pub struct SigningSession<S> {
    params: SignParams,
    signer: S,
}

impl<S: Signer> SigningSession<S> {
    pub fn new(params: SignParams, signer: S) -> Self {
        Self { params, signer }
    }

    /// Stage the artifacts, sign, and write the signed image. Returns the
    /// path of the signed image.
    pub async fn run(&self) -> Result<PathBuf> {
        let p = &self.params;
        ensure_exists(&p.hex_file, "Intel HEX")?;
        ensure_exists(&p.bin_file, "binary")?;

        tokio::fs::create_dir_all(&p.out_dir).await?;
        stage(&p.hex_file, &p.out_dir).await?;
        let staged_bin = stage(&p.bin_file, &p.out_dir).await?;

        let bin = tokio::fs::read(&staged_bin).await?;
        info!(
            "signing {} ({} bytes, sha256 {})",
            staged_bin.display(),
            bin.len(),
            hex::encode(Sha256::digest(&bin))
        );

        let lines = match self.signer.sign(&staged_bin).await? {
            SigningOutcome::SignatureReady(lines) => lines,
            SigningOutcome::SigningTimedOut { waited } => {
                return Err(HexSignError::SigningTimedOut(waited))
            }
        };

        let source = tokio::fs::read(&p.hex_file).await?;
        let image = SignedImageAssembler::new(p.metadata, p.line_ending)
            .assemble(source.as_slice(), &lines)?;

        let output = p.output_path();
        write_atomic(&output, &image)?;
        info!(
            "signed image written to {} ({} signature records)",
            output.display(),
            lines.len()
        );
        Ok(output)
    }
}

/// Copy `src` into `dir`, returning the staged path. Copying a file onto
/// itself is skipped.
async fn stage(src: &Path, dir: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| HexSignError::Other(format!("not a file path: {}", src.display())))?;
    let dest = dir.join(name);
    if tokio::fs::try_exists(&dest).await?
        && tokio::fs::canonicalize(&dest).await? == tokio::fs::canonicalize(src).await?
    {
        return Ok(dest);
    }
    tokio::fs::copy(src, &dest).await?;
    debug!("staged {} -> {}", src.display(), dest.display());
    Ok(dest)
}
