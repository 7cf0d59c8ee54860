use std::path::Path;

use async_trait::async_trait;
use hexsign::{
    signature_lines_from_bytes, MetadataHeader, Result, SignParams, Signer, SigningOutcome,
    SigningSession,
};

/// Dummy signer that returns fixed bytes, for demonstration only.
struct DummySigner;

#[async_trait]
impl Signer for DummySigner {
    async fn sign(&self, binary: &Path) -> Result<SigningOutcome> {
        let data = tokio::fs::read(binary).await?;
        eprintln!("[DummySigner] binary={} len={}", binary.display(), data.len());
        // 256 bytes of 0x11 (RSA-2048 signature size)
        let lines = signature_lines_from_bytes(&[0x11; 256])?;
        Ok(SigningOutcome::SignatureReady(lines))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("Usage: custom_signer <image.hex> <image.bin>");
        eprintln!("Signs an Intel HEX image with a dummy signer.");
        std::process::exit(1);
    }

    let hex = Path::new(&args[1]);
    let out_dir = hex.parent().unwrap_or(Path::new("."));
    let params = SignParams::new(
        hex,
        &args[2],
        out_dir,
        MetadataHeader::new(0x8000, 0x78000, 0x1000_0000, 0x8000),
    );
    let output = SigningSession::new(params, DummySigner).run().await?;
    eprintln!("Done: {} carries a signature of 0x11 bytes", output.display());
    Ok(())
}
