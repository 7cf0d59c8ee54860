//! Intel HEX record codec.
//!
//! A record is one text line:
//!
//! ```text
//! :LLAAAATTDD...DDCC
//! ```
//!
//! `LL` is the payload byte count, `AAAA` the big-endian 16-bit address,
//! `TT` the record type, `DD` the payload and `CC` the two's complement of
//! the byte sum of everything before it. A well-formed record therefore sums
//! to zero mod 256.

use std::fmt;

use serde::Deserialize;

use crate::{HexSignError, Result};

/// First character of every record line.
pub const RECORD_START: char = ':';

/// Data record type.
pub const DATA_RECORD: u8 = 0x00;
/// End-of-file record type.
pub const EOF_RECORD: u8 = 0x01;

/// Payload size of every record this crate emits.
pub const RECORD_SIZE: usize = 16;

/// Highest address representable without extended-address records.
pub const MAX_ADDRESS: u32 = 0xFFFF;

// byte count + 2 address bytes + type + checksum
const RECORD_OVERHEAD: usize = 5;

/// Text length of a full 16-byte record, without the line terminator.
pub const BLOCK_LINE_LEN: usize = 1 + 2 * (RECORD_SIZE + RECORD_OVERHEAD);

/// Line terminator appended to generated records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    /// `\r\n`, as written by the Windows build tooling.
    #[default]
    Crlf,
    /// `\n`.
    Lf,
}

impl LineEnding {
    pub fn as_str(self) -> &'static str {
        match self {
            LineEnding::Crlf => "\r\n",
            LineEnding::Lf => "\n",
        }
    }

    /// Look up by name (`crlf` / `lf`, case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("crlf") {
            Some(LineEnding::Crlf)
        } else if name.eq_ignore_ascii_case("lf") {
            Some(LineEnding::Lf)
        } else {
            None
        }
    }
}

impl fmt::Display for LineEnding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineEnding::Crlf => f.write_str("crlf"),
            LineEnding::Lf => f.write_str("lf"),
        }
    }
}

/// Record checksum: two's complement of the byte sum of all other fields.
pub fn checksum(byte_count: u8, address: u16, record_type: u8, payload: &[u8]) -> u8 {
    let [hi, lo] = address.to_be_bytes();
    let sum = payload.iter().fold(
        byte_count
            .wrapping_add(hi)
            .wrapping_add(lo)
            .wrapping_add(record_type),
        |acc, &b| acc.wrapping_add(b),
    );
    (!sum).wrapping_add(1)
}

/// Encode one record line.
///
/// Only the first `byte_count` bytes of `payload` are written, and only
/// those bytes take part in the checksum. A payload shorter than
/// `byte_count` is rejected.
pub fn encode_record(
    byte_count: u8,
    address: u16,
    record_type: u8,
    payload: &[u8],
    line_ending: LineEnding,
) -> Result<String> {
    let data = payload
        .get(..byte_count as usize)
        .ok_or(HexSignError::ShortPayload {
            byte_count,
            len: payload.len(),
        })?;
    Ok(format_record(address, record_type, data, line_ending))
}

fn format_record(address: u16, record_type: u8, data: &[u8], line_ending: LineEnding) -> String {
    let byte_count = data.len() as u8;
    let mut line = String::with_capacity(1 + 2 * (data.len() + RECORD_OVERHEAD) + 2);
    line.push(RECORD_START);
    line.push_str(&format!("{byte_count:02X}{address:04X}{record_type:02X}"));
    line.push_str(&hex::encode_upper(data));
    line.push_str(&format!(
        "{:02X}",
        checksum(byte_count, address, record_type, data)
    ));
    line.push_str(line_ending.as_str());
    line
}

/// Convert an absolute address into a record address, making sure a record
/// of `len` bytes starting there stays inside the 16-bit address space.
pub fn record_address(address: u32, len: usize) -> Result<u16> {
    let last = address
        .checked_add((len as u32).saturating_sub(1))
        .ok_or(HexSignError::AddressOverflow { address })?;
    if last > MAX_ADDRESS {
        return Err(HexSignError::AddressOverflow { address });
    }
    Ok(address as u16)
}

/// A single decoded (or to-be-encoded) record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    address: u16,
    record_type: u8,
    payload: Vec<u8>,
}

impl Record {
    /// A 16-byte data record.
    pub fn block(address: u16, payload: [u8; RECORD_SIZE]) -> Self {
        Self {
            address,
            record_type: DATA_RECORD,
            payload: payload.to_vec(),
        }
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn record_type(&self) -> u8 {
        self.record_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn byte_count(&self) -> u8 {
        self.payload.len() as u8
    }

    pub fn is_data(&self) -> bool {
        self.record_type == DATA_RECORD
    }

    /// Serialize to a text line including the terminator.
    pub fn encode(&self, line_ending: LineEnding) -> String {
        format_record(self.address, self.record_type, &self.payload, line_ending)
    }

    /// Parse one record line. Trailing `\r`/`\n` are ignored; the checksum
    /// is verified.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let body = line
            .strip_prefix(RECORD_START)
            .ok_or_else(|| HexSignError::BadRecord(format!("missing '{RECORD_START}' start code")))?;

        let bytes = hex::decode(body)
            .map_err(|e| HexSignError::BadRecord(format!("invalid hex: {e}")))?;
        if bytes.len() < RECORD_OVERHEAD {
            return Err(HexSignError::BadRecord(format!(
                "record too short ({} bytes)",
                bytes.len()
            )));
        }

        let byte_count = bytes[0] as usize;
        if bytes.len() != byte_count + RECORD_OVERHEAD {
            return Err(HexSignError::BadRecord(format!(
                "byte count {byte_count} does not match record length {}",
                bytes.len() - RECORD_OVERHEAD
            )));
        }

        let address = u16::from_be_bytes([bytes[1], bytes[2]]);
        let record_type = bytes[3];
        let payload = &bytes[4..4 + byte_count];
        let found = bytes[4 + byte_count];
        let expected = checksum(byte_count as u8, address, record_type, payload);
        if found != expected {
            return Err(HexSignError::BadChecksum { expected, found });
        }

        Ok(Self {
            address,
            record_type,
            payload: payload.to_vec(),
        })
    }
}
