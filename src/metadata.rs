//! Bootloader metadata header.
//!
//! The signed image starts with a reserved region of [`METADATA_RECORD_COUNT`]
//! records at addresses `0x0000..=0x00FF`. The first record carries the
//! [`MetadataHeader`]; the remaining ones are filler (`0xFF`).

use std::fmt;

use crate::record::{Record, RECORD_SIZE};
use crate::{HexSignError, Result};

/// Records in the reserved region (header + filler).
pub const METADATA_RECORD_COUNT: usize = 16;

/// Payload byte of filler records.
pub const FILLER_BYTE: u8 = 0xFF;

/// Size of the reserved region in bytes of address space.
pub const RESERVED_REGION_SIZE: u32 = (METADATA_RECORD_COUNT * RECORD_SIZE) as u32;

/// Size of the packed header in bytes.
pub const METADATA_HEADER_SIZE: usize = 16;

/// Memory regions the bootloader validates the image against.
///
/// All fields are stored **little-endian** in the header record.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataHeader {
    /// Start address of the application code
    pub code_offset: u32,
    /// Size of the application code in bytes
    pub code_size: u32,
    /// Start address of the application RAM
    pub ram_offset: u32,
    /// Size of the application RAM in bytes
    pub ram_size: u32,
}

impl MetadataHeader {
    pub fn new(code_offset: u32, code_size: u32, ram_offset: u32, ram_size: u32) -> Self {
        Self {
            code_offset,
            code_size,
            ram_offset,
            ram_size,
        }
    }

    /// Serialize to the 16-byte little-endian layout.
    pub fn to_bytes(&self) -> [u8; METADATA_HEADER_SIZE] {
        let mut buf = [0u8; METADATA_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.code_offset.to_le_bytes());
        buf[4..8].copy_from_slice(&self.code_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.ram_offset.to_le_bytes());
        buf[12..16].copy_from_slice(&self.ram_size.to_le_bytes());
        buf
    }

    /// Deserialize from a header record payload (must be exactly 16 bytes).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let buf: &[u8; METADATA_HEADER_SIZE] = data.try_into().map_err(|_| {
            HexSignError::BadRecord(format!(
                "metadata header must be {METADATA_HEADER_SIZE} bytes, got {}",
                data.len()
            ))
        })?;
        let field = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Ok(Self {
            code_offset: field(0),
            code_size: field(4),
            ram_offset: field(8),
            ram_size: field(12),
        })
    }

    /// Build the reserved region: the header record at address 0 followed by
    /// the filler records.
    ///
    /// Returns the records and the first address after the region.
    pub fn records(&self) -> (Vec<Record>, u32) {
        let mut records = Vec::with_capacity(METADATA_RECORD_COUNT);
        records.push(Record::block(0, self.to_bytes()));
        for i in 1..METADATA_RECORD_COUNT {
            records.push(Record::block(
                (i * RECORD_SIZE) as u16,
                [FILLER_BYTE; RECORD_SIZE],
            ));
        }
        (records, RESERVED_REGION_SIZE)
    }
}

impl fmt::Debug for MetadataHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataHeader")
            .field("code_offset", &format_args!("0x{:08x}", self.code_offset))
            .field("code_size", &format_args!("0x{:08x}", self.code_size))
            .field("ram_offset", &format_args!("0x{:08x}", self.ram_offset))
            .field("ram_size", &format_args!("0x{:08x}", self.ram_size))
            .finish()
    }
}

/// Returns true if `record` is a filler record of the reserved region.
pub fn is_filler(record: &Record) -> bool {
    record.is_data()
        && record.payload().len() == RECORD_SIZE
        && record.payload().iter().all(|&b| b == FILLER_BYTE)
}
