//! On-disk layout of journal extents and records
//!
//! Each extent file starts with a one-sblk [`ExtentHeader`], followed by a
//! dense, dblk-aligned sequence of records:
//!
//! ```text
//! +----------------------+------+------+------------------+---------+
//! | RecordHeader (48 B)  | xid  | data | RecordTail (12B) | padding |
//! +----------------------+------+------+------------------+---------+
//! ```
//!
//! Records carry the tag of the extent they were written into. A record whose
//! tag differs from its extent header is stale data left behind by an earlier
//! use of a recycled file and marks the end of the extent's valid content.

mod checksum;
mod header;
mod record;

pub use checksum::compute_checksum;
pub use header::ExtentHeader;
pub use record::{
    encode_record, RecordHeader, RecordTail, RecordType, FLAG_EXTERNAL, FLAG_TRANSIENT, FLAG_TXN_COML_COMMIT,
};

use thiserror::Error;

/// Size of a storage block. Extent headers occupy exactly one.
pub const SBLK_SIZE: usize = 4096;

/// Record alignment unit.
pub const DBLK_SIZE: usize = 128;

/// Format version written into every header.
pub const FORMAT_VERSION: u16 = 1;

/// Magic number identifying an extent header ("MJXF").
pub const EXTENT_MAGIC: u32 = 0x4D4A_5846;

/// Magic number identifying a record header ("MJRC").
pub const RECORD_MAGIC: u32 = 0x4D4A_5243;

/// Rounds `len` up to the next multiple of [`DBLK_SIZE`].
pub fn dblk_align(len: usize) -> usize {
    (len + DBLK_SIZE - 1) / DBLK_SIZE * DBLK_SIZE
}

/// Errors produced while decoding on-disk structures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("buffer too short: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("bad magic 0x{found:08x}")]
    BadMagic { found: u32 },

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    #[error("unknown record type {0}")]
    UnknownRecordType(u8),

    #[error("extent header checksum mismatch")]
    HeaderChecksum,

    #[error("journal id too long: {0} bytes")]
    JournalIdTooLong(usize),
}

/// Result type for format operations
pub type FormatResult<T> = Result<T, FormatError>;

pub(crate) fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dblk_align() {
        assert_eq!(dblk_align(0), 0);
        assert_eq!(dblk_align(1), DBLK_SIZE);
        assert_eq!(dblk_align(DBLK_SIZE), DBLK_SIZE);
        assert_eq!(dblk_align(DBLK_SIZE + 1), 2 * DBLK_SIZE);
    }

    #[test]
    fn test_sblk_is_dblk_multiple() {
        assert_eq!(SBLK_SIZE % DBLK_SIZE, 0);
    }
}
