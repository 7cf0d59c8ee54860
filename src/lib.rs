//! # hexsign
//!
//! A Rust library for producing signed Intel HEX firmware images for the
//! ZAYA-OS bootloader.
//!
//! A signed image is the original record stream with two blocks spliced in
//! right after its first line:
//!
//! - **Metadata region**: one record at address `0x0000` carrying the code
//!   and RAM regions (four little-endian `u32`s), then 15 filler records of
//!   `0xFF`, reserving `0x0000..=0x00FF`
//! - **Signature block**: the signature produced by an external signer,
//!   16 bytes per record, starting at `0x0110`
//!
//! ## Example
//!
//! ```no_run
//! use hexsign::{LineEnding, MetadataHeader, SignedImageAssembler};
//!
//! let metadata = MetadataHeader::new(0x8000, 0x78000, 0x1000_0000, 0x8000);
//! let assembler = SignedImageAssembler::new(metadata, LineEnding::Crlf);
//! assembler
//!     .assemble_file("app.hex", "app.bin.sig", "app.hex.signed")
//!     .unwrap();
//! ```

pub mod assemble;
pub mod config;
pub mod inspect;
pub mod metadata;
pub mod record;
pub mod session;
pub mod signature;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub use assemble::{signed_output_path, write_atomic, SignedImageAssembler, SIGNED_SUFFIX};
pub use config::Config;
pub use inspect::{inspect_signed_bytes, inspect_signed_image, print_image_info, SignedImageInfo};
pub use metadata::MetadataHeader;
pub use record::{encode_record, LineEnding, Record};
pub use session::{
    wait_for_artifact, ExternalSigner, SignParams, SignatureFileSigner, Signer, SigningOutcome,
    SigningSession,
};
pub use signature::{encode_signature_records, signature_lines_from_bytes};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HexSignError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("source record stream is empty (no header line)")]
    TruncatedSourceStream,

    #[error("malformed signature line {line}: {reason}")]
    MalformedSignatureLine { line: usize, reason: String },

    #[error("address 0x{address:x} is outside the 16-bit record address space")]
    AddressOverflow { address: u32 },

    #[error("payload of {len} bytes is shorter than byte count {byte_count}")]
    ShortPayload { byte_count: u8, len: usize },

    #[error("bad record: {0}")]
    BadRecord(String),

    #[error("bad record checksum (expected 0x{expected:02X}, found 0x{found:02X})")]
    BadChecksum { expected: u8, found: u8 },

    #[error("line {line}: {source}")]
    AtLine {
        line: usize,
        source: Box<HexSignError>,
    },

    #[error("{kind} file does not exist: {}", path.display())]
    MissingArtifact { kind: &'static str, path: PathBuf },

    #[error("signer failed: {0}")]
    SignerFailed(String),

    #[error("no signature produced within {0:?}")]
    SigningTimedOut(Duration),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, HexSignError>;
