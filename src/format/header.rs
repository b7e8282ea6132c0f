//! Extent file header
//!
//! Occupies the first sblk of every extent. Layout (little endian):
//!
//! | offset | size | field                           |
//! |--------|------|---------------------------------|
//! | 0      | 4    | magic                           |
//! | 4      | 2    | format version                  |
//! | 6      | 2    | journal id length               |
//! | 8      | 8    | queue id                        |
//! | 16     | 8    | serial (write order)            |
//! | 24     | 8    | tag stamped into every record   |
//! | 32     | 8    | first record id of this extent  |
//! | 40     | 8    | creation time, unix millis      |
//! | 48     | 4    | CRC32 of bytes 0..48 and the id |
//! | 52     | n    | journal id (UTF-8)              |

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use super::{
    compute_checksum, read_u16, read_u32, read_u64, FormatError, FormatResult, EXTENT_MAGIC,
    FORMAT_VERSION, SBLK_SIZE,
};

const FIXED_LEN: usize = 52;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentHeader {
    pub journal_id: String,
    pub queue_id: u64,
    pub serial: u64,
    pub tag: u64,
    pub first_rid: u64,
    pub created_millis: i64,
}

impl ExtentHeader {
    /// Longest journal id that fits in the header block.
    pub const MAX_JOURNAL_ID_LEN: usize = SBLK_SIZE - FIXED_LEN;

    /// Creates a header for a freshly acquired extent with a new random tag.
    pub fn new(journal_id: &str, queue_id: u64, serial: u64, first_rid: u64) -> Self {
        // A zero tag would be indistinguishable from unwritten space.
        let tag = Uuid::new_v4().as_u64_pair().0.max(1);
        Self {
            journal_id: journal_id.to_string(),
            queue_id,
            serial,
            tag,
            first_rid,
            created_millis: Utc::now().timestamp_millis(),
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_millis).single()
    }

    /// Encodes into a full sblk.
    pub fn encode(&self) -> FormatResult<Vec<u8>> {
        let id = self.journal_id.as_bytes();
        if id.len() > Self::MAX_JOURNAL_ID_LEN {
            return Err(FormatError::JournalIdTooLong(id.len()));
        }

        let mut buf = vec![0u8; SBLK_SIZE];
        buf[0..4].copy_from_slice(&EXTENT_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&(id.len() as u16).to_le_bytes());
        buf[8..16].copy_from_slice(&self.queue_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.serial.to_le_bytes());
        buf[24..32].copy_from_slice(&self.tag.to_le_bytes());
        buf[32..40].copy_from_slice(&self.first_rid.to_le_bytes());
        buf[40..48].copy_from_slice(&self.created_millis.to_le_bytes());
        buf[FIXED_LEN..FIXED_LEN + id.len()].copy_from_slice(id);

        let checksum = Self::checksum(&buf, id.len());
        buf[48..52].copy_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    /// Decodes a header block.
    ///
    /// Returns `Ok(None)` when the block was never written (zero magic),
    /// which is the state a returned extent is left in.
    pub fn decode(buf: &[u8]) -> FormatResult<Option<Self>> {
        if buf.len() < FIXED_LEN {
            return Err(FormatError::Truncated {
                needed: FIXED_LEN,
                available: buf.len(),
            });
        }
        let magic = read_u32(buf, 0);
        if magic == 0 {
            return Ok(None);
        }
        if magic != EXTENT_MAGIC {
            return Err(FormatError::BadMagic { found: magic });
        }
        let version = read_u16(buf, 4);
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let id_len = read_u16(buf, 6) as usize;
        if id_len > Self::MAX_JOURNAL_ID_LEN {
            return Err(FormatError::JournalIdTooLong(id_len));
        }
        if buf.len() < FIXED_LEN + id_len {
            return Err(FormatError::Truncated {
                needed: FIXED_LEN + id_len,
                available: buf.len(),
            });
        }
        if read_u32(buf, 48) != Self::checksum(buf, id_len) {
            return Err(FormatError::HeaderChecksum);
        }

        let journal_id = String::from_utf8_lossy(&buf[FIXED_LEN..FIXED_LEN + id_len]).into_owned();
        Ok(Some(Self {
            journal_id,
            queue_id: read_u64(buf, 8),
            serial: read_u64(buf, 16),
            tag: read_u64(buf, 24),
            first_rid: read_u64(buf, 32),
            created_millis: read_u64(buf, 40) as i64,
        }))
    }

    fn checksum(buf: &[u8], id_len: usize) -> u32 {
        let mut covered = Vec::with_capacity(48 + id_len);
        covered.extend_from_slice(&buf[0..48]);
        covered.extend_from_slice(&buf[FIXED_LEN..FIXED_LEN + id_len]);
        compute_checksum(&covered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = ExtentHeader::new("queue-orders", 42, 3, 1001);
        let buf = header.encode().unwrap();
        assert_eq!(buf.len(), SBLK_SIZE);

        let decoded = ExtentHeader::decode(&buf).unwrap().unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.created_at().is_some());
    }

    #[test]
    fn test_fresh_tags_differ() {
        let a = ExtentHeader::new("q", 0, 1, 1);
        let b = ExtentHeader::new("q", 0, 1, 1);
        assert_ne!(a.tag, b.tag);
        assert_ne!(a.tag, 0);
    }

    #[test]
    fn test_zeroed_block_is_unwritten() {
        assert_eq!(ExtentHeader::decode(&vec![0u8; SBLK_SIZE]).unwrap(), None);
    }

    #[test]
    fn test_header_corruption_detected() {
        let mut buf = ExtentHeader::new("queue-orders", 1, 1, 1).encode().unwrap();
        buf[17] ^= 0x40;
        assert_eq!(ExtentHeader::decode(&buf), Err(FormatError::HeaderChecksum));
    }

    #[test]
    fn test_journal_id_too_long() {
        let long = "x".repeat(ExtentHeader::MAX_JOURNAL_ID_LEN + 1);
        let header = ExtentHeader::new(&long, 0, 1, 1);
        assert!(matches!(
            header.encode(),
            Err(FormatError::JournalIdTooLong(_))
        ));
    }
}
