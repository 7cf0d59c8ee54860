use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use hexsign::config::expand_bin;
use hexsign::*;

/// Embed the bootloader metadata header and an external signature into an
/// Intel HEX firmware image.
#[derive(Parser, Debug)]
#[command(
    name = "hexsign",
    version,
    about = "Create and inspect signed Intel HEX images (metadata header + signature)"
)]
struct Cli {
    /// Configuration file (TOML); command line options take precedence
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Set code region start (hex, e.g. 8000)
    #[arg(long = "code-offset")]
    code_offset: Option<String>,

    /// Set code region size (hex)
    #[arg(long = "code-size")]
    code_size: Option<String>,

    /// Set RAM region start (hex, e.g. 10000000)
    #[arg(long = "ram-offset")]
    ram_offset: Option<String>,

    /// Set RAM region size (hex)
    #[arg(long = "ram-size")]
    ram_size: Option<String>,

    /// Binary handed to the signer (default: HEX file with .bin extension)
    #[arg(short = 'b', long = "binary")]
    binary: Option<PathBuf>,

    /// Directory the build artifacts are copied into (default: HEX file directory)
    #[arg(short = 'o', long = "out-dir")]
    out_dir: Option<PathBuf>,

    /// Use an existing signature file instead of running a signer
    #[arg(short = 's', long = "signature")]
    signature: Option<PathBuf>,

    /// Signer executable
    #[arg(short = 'S', long = "signer")]
    signer: Option<String>,

    /// Signer argument, repeatable; {bin} is replaced by the binary path
    #[arg(short = 'a', long = "signer-arg", allow_hyphen_values = true)]
    signer_args: Vec<String>,

    /// Signature file left by the signer (default: {bin}.sig)
    #[arg(long = "signer-output")]
    signer_output: Option<String>,

    /// Seconds to wait for the signer
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Line ending of generated records (crlf, lf)
    #[arg(short = 'e', long = "line-ending")]
    line_ending: Option<String>,

    /// Suffix appended to the HEX file name for the signed image
    #[arg(long = "suffix")]
    suffix: Option<String>,

    /// Project name; resolves <root>/Projects/<name>/uVision/Objects/<name>.hex
    #[arg(short = 'p', long = "project")]
    project: Option<String>,

    /// Repository root used with -p
    #[arg(short = 'r', long = "root", default_value = ".")]
    root: PathBuf,

    /// List signed image information
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// The Intel HEX image to sign (or the signed image for -l)
    #[arg()]
    hexfile: Option<PathBuf>,
}

fn parse_hex_u32(s: &str) -> Result<u32> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16).map_err(|_| HexSignError::Other(format!("invalid hex value: {}", s)))
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Fold command line options into the configuration.
fn apply_overrides(cli: &Cli, cfg: &mut Config) -> Result<()> {
    let m = &mut cfg.metadata;
    for (arg, field) in [
        (&cli.code_offset, &mut m.code_offset),
        (&cli.code_size, &mut m.code_size),
        (&cli.ram_offset, &mut m.ram_offset),
        (&cli.ram_size, &mut m.ram_size),
    ] {
        if let Some(s) = arg {
            *field = Some(parse_hex_u32(s)?);
        }
    }

    if let Some(ref program) = cli.signer {
        cfg.signer.program = Some(program.clone());
    }
    if !cli.signer_args.is_empty() {
        cfg.signer.args = cli.signer_args.clone();
    }
    if let Some(ref output) = cli.signer_output {
        cfg.signer.signature_file = Some(output.clone());
    }
    if let Some(secs) = cli.timeout {
        cfg.signer.timeout_secs = secs;
    }

    if let Some(ref name) = cli.line_ending {
        cfg.output.line_ending = LineEnding::from_name(name)
            .ok_or_else(|| HexSignError::Other(format!("invalid line ending '{name}' (crlf, lf)")))?;
    }
    if let Some(ref suffix) = cli.suffix {
        cfg.output.suffix = suffix.clone();
    }
    Ok(())
}

fn build_params(cli: &Cli, cfg: &Config, metadata: MetadataHeader) -> Result<SignParams> {
    let mut params = if let Some(ref name) = cli.project {
        SignParams::for_project(&cli.root, name, metadata)
    } else {
        let hexfile = cli
            .hexfile
            .clone()
            .ok_or_else(|| HexSignError::Other("Missing input HEX filename".into()))?;
        let bin = cli
            .binary
            .clone()
            .unwrap_or_else(|| hexfile.with_extension("bin"));
        let out_dir = cli.out_dir.clone().unwrap_or_else(|| match hexfile.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        });
        SignParams::new(hexfile, bin, out_dir, metadata)
    };
    if cli.project.is_some() {
        if let Some(ref dir) = cli.out_dir {
            params.out_dir = dir.clone();
        }
    }
    params.line_ending = cfg.output.line_ending;
    params.suffix = cfg.output.suffix.clone();
    Ok(params)
}

async fn run_session<S: Signer>(params: SignParams, signer: S, quiet: bool) {
    match SigningSession::new(params, signer).run().await {
        Ok(output) => {
            if !quiet {
                eprintln!("Signed image '{}' created successfully.", output.display());
            }
        }
        Err(e) => {
            eprintln!("hexsign: {}", e);
            process::exit(1);
        }
    }
}

fn list(path: &Path, quiet: bool) -> ! {
    match inspect_signed_image(path) {
        Ok(info) => {
            if !quiet {
                print_image_info(&info);
            }
            process::exit(0);
        }
        Err(e) => {
            eprintln!("hexsign: {}: {}", path.display(), e);
            process::exit(1);
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    // ---- List mode ----
    if cli.list {
        match &cli.hexfile {
            Some(f) => list(f, cli.quiet),
            None => {
                eprintln!("Error: Missing image filename");
                process::exit(1);
            }
        }
    }

    // ---- Sign mode ----
    let mut cfg = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("hexsign: {}", e);
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Err(e) = apply_overrides(&cli, &mut cfg) {
        eprintln!("hexsign: {}", e);
        process::exit(1);
    }

    let params = match cfg
        .metadata_header()
        .and_then(|metadata| build_params(&cli, &cfg, metadata))
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("hexsign: {}", e);
            process::exit(1);
        }
    };

    if let Some(ref sig) = cli.signature {
        run_session(params, SignatureFileSigner::new(sig), cli.quiet).await;
    } else if cfg.signer.program.is_some() {
        match ExternalSigner::from_config(&cfg.signer) {
            Ok(signer) => run_session(params, signer, cli.quiet).await,
            Err(e) => {
                eprintln!("hexsign: {}", e);
                process::exit(1);
            }
        }
    } else if let Some(ref template) = cfg.signer.signature_file {
        let sig = expand_bin(template, &params.bin_file);
        run_session(params, SignatureFileSigner::new(sig), cli.quiet).await;
    } else {
        eprintln!("Error: no signer configured (use -S, -s or a [signer] config section)");
        process::exit(1);
    }
}
