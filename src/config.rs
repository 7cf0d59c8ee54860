//! TOML configuration file.
//!
//! ```toml
//! [metadata]
//! code_offset = 0x8000
//! code_size   = 0x78000
//! ram_offset  = 0x10000000
//! ram_size    = 0x8000
//!
//! [signer]
//! program = "rsa_sign"
//! args = ["{bin}", "keys/rsa_priv.txt"]
//! signature_file = "{bin}.sig"
//! poll_interval_ms = 100
//! timeout_secs = 30
//!
//! [output]
//! line_ending = "crlf"
//! suffix = ".signed"
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::assemble::SIGNED_SUFFIX;
use crate::metadata::MetadataHeader;
use crate::record::LineEnding;
use crate::{HexSignError, Result};

/// Placeholder in signer arguments replaced by the path of the binary.
pub const BIN_PLACEHOLDER: &str = "{bin}";

const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub metadata: MetadataConfig,
    pub signer: SignerConfig,
    pub output: OutputConfig,
}

/// Metadata header fields. Each is required by the time an image is signed,
/// but may come from the command line instead.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetadataConfig {
    pub code_offset: Option<u32>,
    pub code_size: Option<u32>,
    pub ram_offset: Option<u32>,
    pub ram_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignerConfig {
    /// Signer executable. Without one, `signature_file` must already exist.
    pub program: Option<String>,
    pub args: Vec<String>,
    /// Where the signer leaves its signature (may contain `{bin}`).
    pub signature_file: Option<String>,
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            signature_file: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl SignerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub line_ending: LineEnding,
    pub suffix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            line_ending: LineEnding::default(),
            suffix: SIGNED_SUFFIX.to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            HexSignError::Config(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(text).map_err(|e| HexSignError::Config(e.to_string()))?;
        if cfg.signer.poll_interval_ms == 0 {
            return Err(HexSignError::Config(
                "signer.poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(cfg)
    }

    /// The metadata header, failing if any field is unset.
    pub fn metadata_header(&self) -> Result<MetadataHeader> {
        let m = &self.metadata;
        let require = |v: Option<u32>, name: &str| {
            v.ok_or_else(|| HexSignError::Config(format!("metadata field '{name}' is not set")))
        };
        Ok(MetadataHeader::new(
            require(m.code_offset, "code_offset")?,
            require(m.code_size, "code_size")?,
            require(m.ram_offset, "ram_offset")?,
            require(m.ram_size, "ram_size")?,
        ))
    }
}

/// Replace every `{bin}` in `template` with `bin`.
pub fn expand_bin(template: &str, bin: &Path) -> String {
    template.replace(BIN_PLACEHOLDER, &bin.to_string_lossy())
}
