//! Signature block encoding.
//!
//! The external signer writes its signature as text, one line of 32 hex
//! digits (16 bytes) per line. Each line becomes one data record placed
//! after the reserved metadata region.

use std::io::BufRead;

use log::debug;

use crate::record::{record_address, Record, RECORD_SIZE};
use crate::{HexSignError, Result};

/// Hex digits per signature line.
pub const SIGNATURE_LINE_HEX_LEN: usize = RECORD_SIZE * 2;

/// Decode one signature line into its 16 bytes.
///
/// `line_no` is 1-based and only used for error reporting. The line is taken
/// as raw bytes, so anything that is not a hex digit (including bytes that are
/// not valid UTF-8) is reported as a malformed line.
pub fn decode_signature_line(
    line: impl AsRef<[u8]>,
    line_no: usize,
) -> Result<[u8; RECORD_SIZE]> {
    let mut line = line.as_ref();
    while let [rest @ .., b'\r' | b'\n'] = line {
        line = rest;
    }
    let malformed = |reason: String| HexSignError::MalformedSignatureLine {
        line: line_no,
        reason,
    };

    if line.len() != SIGNATURE_LINE_HEX_LEN {
        return Err(malformed(format!(
            "expected {SIGNATURE_LINE_HEX_LEN} hex digits, got {}",
            line.len()
        )));
    }
    let mut bytes = [0u8; RECORD_SIZE];
    hex::decode_to_slice(line, &mut bytes).map_err(|e| malformed(e.to_string()))?;
    Ok(bytes)
}

/// Encode the signature lines as data records.
///
/// The address is advanced by one record **before** each record is emitted,
/// so the first record lands at `start_address + 16`. Returns the records
/// and the address of the last one emitted (or `start_address` when there
/// are no lines).
pub fn encode_signature_records<S: AsRef<[u8]>>(
    lines: &[S],
    start_address: u32,
) -> Result<(Vec<Record>, u32)> {
    let mut address = start_address;
    let mut records = Vec::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        address = address
            .checked_add(RECORD_SIZE as u32)
            .ok_or(HexSignError::AddressOverflow { address })?;
        let record_addr = record_address(address, RECORD_SIZE)?;
        let bytes = decode_signature_line(line.as_ref(), i + 1)?;
        records.push(Record::block(record_addr, bytes));
    }

    debug!(
        "encoded {} signature records starting at 0x{:04x}",
        records.len(),
        start_address.wrapping_add(RECORD_SIZE as u32)
    );
    Ok((records, address))
}

/// Read and validate signature lines from a stream.
///
/// The stream is split on `\n` as bytes; each line is decoded right away so
/// a bad line is reported with its line number. Lines come back normalized
/// to upper-case hex.
pub fn read_signature_lines(reader: impl BufRead) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for (i, line) in reader.split(b'\n').enumerate() {
        let bytes = decode_signature_line(line?, i + 1)?;
        lines.push(hex::encode_upper(bytes));
    }
    Ok(lines)
}

/// Format a raw signature as signature-file lines.
///
/// The signature length must be a multiple of 16 bytes.
pub fn signature_lines_from_bytes(signature: &[u8]) -> Result<Vec<String>> {
    let chunks = signature.chunks_exact(RECORD_SIZE);
    if !chunks.remainder().is_empty() {
        return Err(HexSignError::MalformedSignatureLine {
            line: signature.len() / RECORD_SIZE + 1,
            reason: format!(
                "signature length {} is not a multiple of {RECORD_SIZE} bytes",
                signature.len()
            ),
        });
    }
    Ok(chunks.map(hex::encode_upper).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RESERVED_REGION_SIZE;

    const LINE_A: &str = "000102030405060708090A0B0C0D0E0F";
    const LINE_B: &str = "f0e1d2c3b4a5968778695a4b3c2d1e0f";

    #[test]
    fn first_record_follows_reserved_region() {
        let (records, last) =
            encode_signature_records(&[LINE_A, LINE_B], RESERVED_REGION_SIZE).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].address(), 272);
        assert_eq!(records[1].address(), 288);
        assert_eq!(last, 288);
        assert_eq!(records[0].payload(), hex::decode(LINE_A).unwrap());
        assert_eq!(records[1].payload(), hex::decode(LINE_B).unwrap());
    }

    #[test]
    fn strips_line_terminators() {
        let bytes = decode_signature_line("000102030405060708090A0B0C0D0E0F\r\n", 1).unwrap();
        assert_eq!(bytes[15], 0x0F);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = encode_signature_records(&[LINE_A, "0011"], 256).unwrap_err();
        assert!(matches!(
            err,
            HexSignError::MalformedSignatureLine { line: 2, .. }
        ));
        assert!(decode_signature_line("", 1).is_err());
        assert!(decode_signature_line(&format!("{LINE_A}00"), 1).is_err());
    }

    #[test]
    fn rejects_non_hex() {
        let err = decode_signature_line("000102030405060708090A0B0C0D0EZZ", 7).unwrap_err();
        assert!(matches!(
            err,
            HexSignError::MalformedSignatureLine { line: 7, .. }
        ));
    }

    #[test]
    fn empty_signature_emits_nothing() {
        let lines: [&str; 0] = [];
        let (records, last) = encode_signature_records(&lines, 256).unwrap();
        assert!(records.is_empty());
        assert_eq!(last, 256);
    }

    #[test]
    fn overflow_is_reported() {
        // 0xFFF0 is the last record that fits; the next one does not.
        let ok = encode_signature_records(&[LINE_A], 0xFFE0).unwrap();
        assert_eq!(ok.0[0].address(), 0xFFF0);
        let err = encode_signature_records(&[LINE_A, LINE_A], 0xFFE0).unwrap_err();
        assert!(matches!(
            err,
            HexSignError::AddressOverflow { address: 0x10000 }
        ));
    }

    #[test]
    fn raw_signature_to_lines() {
        let sig: Vec<u8> = (0u8..32).collect();
        let lines = signature_lines_from_bytes(&sig).unwrap();
        assert_eq!(lines, vec![LINE_A, "101112131415161718191A1B1C1D1E1F"]);
        assert!(signature_lines_from_bytes(&sig[..20]).is_err());
    }

    #[test]
    fn reads_lines_from_stream() {
        let text = format!("{LINE_A}\r\n{LINE_B}\n");
        let lines = read_signature_lines(text.as_bytes()).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], LINE_A);
        assert_eq!(lines[1], LINE_B.to_uppercase());
    }

    #[test]
    fn non_utf8_line_is_malformed() {
        let mut data = format!("{LINE_A}\n").into_bytes();
        data.extend_from_slice(b"00112233445566778899AABBCCDDEE\xC3(\n");
        let err = read_signature_lines(&data[..]).unwrap_err();
        assert!(matches!(
            err,
            HexSignError::MalformedSignatureLine { line: 2, .. }
        ));
        assert!(decode_signature_line(b"\xFF\xFE", 3).is_err());
    }
}
