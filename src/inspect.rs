//! Reading back signed images.

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::metadata::{is_filler, MetadataHeader, METADATA_RECORD_COUNT, RESERVED_REGION_SIZE};
use crate::record::{Record, RECORD_SIZE};
use crate::{HexSignError, Result};

/// What was found in a signed image.
#[derive(Debug, Clone)]
pub struct SignedImageInfo {
    /// The structural header line, without terminator.
    pub header_line: String,
    pub metadata: MetadataHeader,
    /// Filler records following the metadata record.
    pub filler_records: usize,
    /// Address of the first signature record (if any).
    pub signature_address: Option<u16>,
    pub signature: Vec<u8>,
    /// Records of the original image after the signature block.
    pub image_records: usize,
}

/// Read a signed image and verify every record in it.
pub fn inspect_signed_image(path: impl AsRef<Path>) -> Result<SignedImageInfo> {
    let data = fs::read(path.as_ref())?;
    inspect_signed_bytes(&data)
}

/// Same as [`inspect_signed_image`] but works on an in-memory buffer.
///
/// Checks:
/// 1. A metadata record at address 0 directly follows the header line
/// 2. It is followed by the filler records of the reserved region
/// 3. Every record line after the header has a valid checksum
///
/// The signature is the run of 16-byte data records at consecutive
/// addresses starting at `0x0110`.
pub fn inspect_signed_bytes(data: &[u8]) -> Result<SignedImageInfo> {
    let text = std::str::from_utf8(data)
        .map_err(|e| HexSignError::BadRecord(format!("image is not text: {e}")))?;
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
        .filter(|(_, l)| !l.is_empty());

    let (_, header_line) = lines.next().ok_or(HexSignError::TruncatedSourceStream)?;

    let mut records = Vec::new();
    for (line_no, line) in lines {
        let record = Record::parse(line).map_err(|e| HexSignError::AtLine {
            line: line_no,
            source: Box::new(e),
        })?;
        records.push(record);
    }
    let mut records = records.into_iter().peekable();

    let metadata = match records.next() {
        Some(r) if r.is_data() && r.address() == 0 => MetadataHeader::from_bytes(r.payload())?,
        _ => {
            return Err(HexSignError::Other(
                "no metadata record at address 0x0000 after the header line".into(),
            ))
        }
    };

    let mut filler_records = 0;
    while filler_records < METADATA_RECORD_COUNT - 1 {
        let expected = ((filler_records + 1) * RECORD_SIZE) as u16;
        match records.peek() {
            Some(r) if is_filler(r) && r.address() == expected => {
                records.next();
                filler_records += 1;
            }
            _ => break,
        }
    }
    if filler_records != METADATA_RECORD_COUNT - 1 {
        return Err(HexSignError::Other(format!(
            "reserved region incomplete: {filler_records} of {} filler records",
            METADATA_RECORD_COUNT - 1
        )));
    }

    let first_sig = RESERVED_REGION_SIZE + RECORD_SIZE as u32;
    let mut signature = Vec::new();
    let mut next = first_sig;
    while let Some(r) = records.peek() {
        if !(r.is_data() && r.payload().len() == RECORD_SIZE && u32::from(r.address()) == next) {
            break;
        }
        signature.extend_from_slice(r.payload());
        next += RECORD_SIZE as u32;
        records.next();
    }
    let signature_address = (!signature.is_empty()).then_some(first_sig as u16);

    Ok(SignedImageInfo {
        header_line: header_line.to_string(),
        metadata,
        filler_records,
        signature_address,
        signature,
        image_records: records.count(),
    })
}

fn print_size(label: &str, size: u32) {
    if size >= 1024 * 1024 {
        println!(
            "{label}0x{size:08x} ({size} Bytes = {:.2} MiB)",
            size as f64 / (1024.0 * 1024.0)
        );
    } else if size >= 1024 {
        println!("{label}0x{size:08x} ({size} Bytes = {:.2} KiB)", size as f64 / 1024.0);
    } else {
        println!("{label}0x{size:08x} ({size} Bytes)");
    }
}

/// Print signed image information to `stdout`.
pub fn print_image_info(info: &SignedImageInfo) {
    let m = &info.metadata;
    println!("Header Line:  {}", info.header_line);
    println!("Code Offset:  0x{:08x}", m.code_offset);
    print_size("Code Size:    ", m.code_size);
    println!("RAM Offset:   0x{:08x}", m.ram_offset);
    print_size("RAM Size:     ", m.ram_size);
    println!(
        "Reserved:     {} records (0x0000-0x{:04x})",
        info.filler_records + 1,
        RESERVED_REGION_SIZE - 1
    );

    match info.signature_address {
        Some(addr) => {
            println!(
                "Signature:    {} Bytes at 0x{:04x}-0x{:04x}",
                info.signature.len(),
                addr,
                addr as usize + info.signature.len() - 1
            );
            println!("  SHA-256:    {}", hex::encode(Sha256::digest(&info.signature)));
        }
        None => println!("Signature:    (none)"),
    }
    println!("Image:        {} records", info.image_records);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::SignedImageAssembler;
    use crate::record::LineEnding;

    const SOURCE: &str = ":020000040000FA\r\n:040010005501000096\r\n:00000001FF\r\n";

    fn signed(sig_lines: &[&str]) -> Vec<u8> {
        SignedImageAssembler::new(
            MetadataHeader::new(0x1000, 0x2000, 0x1000_0000, 0x4000),
            LineEnding::Crlf,
        )
        .assemble(SOURCE.as_bytes(), sig_lines)
        .unwrap()
    }

    #[test]
    fn reads_back_assembled_image() {
        let sig = [
            "00112233445566778899AABBCCDDEEFF",
            "FFEEDDCCBBAA99887766554433221100",
        ];
        let info = inspect_signed_bytes(&signed(&sig)).unwrap();
        assert_eq!(info.header_line, ":020000040000FA");
        assert_eq!(
            info.metadata,
            MetadataHeader::new(0x1000, 0x2000, 0x1000_0000, 0x4000)
        );
        assert_eq!(info.filler_records, 15);
        assert_eq!(info.signature_address, Some(0x0110));
        assert_eq!(info.signature.len(), 32);
        assert_eq!(info.signature[..16], hex::decode(sig[0]).unwrap()[..]);
        assert_eq!(info.image_records, 2);
    }

    #[test]
    fn unsigned_image_has_no_signature() {
        let lines: [&str; 0] = [];
        let info = inspect_signed_bytes(&signed(&lines)).unwrap();
        assert!(info.signature.is_empty());
        assert_eq!(info.signature_address, None);
        assert_eq!(info.image_records, 2);
    }

    #[test]
    fn corrupted_record_is_located() {
        let mut text = String::from_utf8(signed(&["00112233445566778899AABBCCDDEEFF"])).unwrap();
        // Flip a payload digit of the first filler record (line 3).
        let pos = text.find(":10001000FF").unwrap() + 9;
        text.replace_range(pos..pos + 1, "E");
        let err = inspect_signed_bytes(text.as_bytes()).unwrap_err();
        match err {
            HexSignError::AtLine { line, source } => {
                assert_eq!(line, 3);
                assert!(matches!(*source, HexSignError::BadChecksum { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn plain_image_is_rejected() {
        let err = inspect_signed_bytes(SOURCE.as_bytes()).unwrap_err();
        assert!(matches!(err, HexSignError::Other(_)));
        assert!(matches!(
            inspect_signed_bytes(b""),
            Err(HexSignError::TruncatedSourceStream)
        ));
    }
}
