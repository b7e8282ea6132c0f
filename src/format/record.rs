//! Record header and tail encoding
//!
//! Header layout (48 bytes, little endian):
//!
//! | offset | size | field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 4    | magic                                  |
//! | 4      | 2    | format version                         |
//! | 6      | 1    | record type                            |
//! | 7      | 1    | flags                                  |
//! | 8      | 8    | extent tag                             |
//! | 16     | 8    | record id                              |
//! | 24     | 4    | xid length                             |
//! | 28     | 4    | reserved                               |
//! | 32     | 8    | data length (enqueue)                  |
//! | 40     | 8    | dequeued record id (dequeue)           |
//!
//! Tail layout (12 bytes): CRC32 over header, xid and data; then the record
//! id again so a torn record cannot be mistaken for a complete one.

use super::{
    compute_checksum, dblk_align, read_u16, read_u32, read_u64, FormatError, FormatResult, FORMAT_VERSION,
    RECORD_MAGIC,
};

/// Record payload is not expected to survive a restart.
pub const FLAG_TRANSIENT: u8 = 0x01;
/// Payload bytes are held outside the journal; only metadata is written.
pub const FLAG_EXTERNAL: u8 = 0x02;
/// Dequeue completes its transaction on commit rather than on abort.
pub const FLAG_TXN_COML_COMMIT: u8 = 0x04;

/// Journal record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Message added to the queue
    Enqueue = 1,
    /// Message consumed from the queue
    Dequeue = 2,
    /// Transaction rolled back
    TxnAbort = 3,
    /// Transaction committed
    TxnCommit = 4,
    /// Transaction prepared (two-phase commit, first phase)
    TxnPrepare = 5,
}

impl RecordType {
    /// Convert from u8, returns None for invalid values
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordType::Enqueue),
            2 => Some(RecordType::Dequeue),
            3 => Some(RecordType::TxnAbort),
            4 => Some(RecordType::TxnCommit),
            5 => Some(RecordType::TxnPrepare),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Commit and abort end a transaction; prepare does not.
    pub fn is_txn_boundary(self) -> bool {
        matches!(self, RecordType::TxnAbort | RecordType::TxnCommit)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Enqueue => "enqueue",
            RecordType::Dequeue => "dequeue",
            RecordType::TxnAbort => "txn_abort",
            RecordType::TxnCommit => "txn_commit",
            RecordType::TxnPrepare => "txn_prepare",
        }
    }
}

/// Fixed-size record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: RecordType,
    pub flags: u8,
    pub tag: u64,
    pub rid: u64,
    pub xid_len: u32,
    pub data_len: u64,
    pub deq_rid: u64,
}

impl RecordHeader {
    pub const SIZE: usize = 48;

    pub fn enqueue(tag: u64, rid: u64, xid_len: u32, data_len: u64, flags: u8) -> Self {
        Self {
            record_type: RecordType::Enqueue,
            flags,
            tag,
            rid,
            xid_len,
            data_len,
            deq_rid: 0,
        }
    }

    pub fn dequeue(tag: u64, rid: u64, xid_len: u32, deq_rid: u64, flags: u8) -> Self {
        Self {
            record_type: RecordType::Dequeue,
            flags,
            tag,
            rid,
            xid_len,
            data_len: 0,
            deq_rid,
        }
    }

    pub fn txn(record_type: RecordType, tag: u64, rid: u64, xid_len: u32) -> Self {
        debug_assert!(matches!(
            record_type,
            RecordType::TxnAbort | RecordType::TxnCommit | RecordType::TxnPrepare
        ));
        Self {
            record_type,
            flags: 0,
            tag,
            rid,
            xid_len,
            data_len: 0,
            deq_rid: 0,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.flags & FLAG_TRANSIENT != 0
    }

    pub fn is_external(&self) -> bool {
        self.flags & FLAG_EXTERNAL != 0
    }

    pub fn txn_coml_commit(&self) -> bool {
        self.flags & FLAG_TXN_COML_COMMIT != 0
    }

    /// Number of payload bytes physically stored after the xid.
    pub fn stored_data_len(&self) -> u64 {
        if self.record_type == RecordType::Enqueue && !self.is_external() {
            self.data_len
        } else {
            0
        }
    }

    /// Header, xid and stored data; the range covered by the checksum.
    pub fn body_len(&self) -> u64 {
        Self::SIZE as u64 + self.xid_len as u64 + self.stored_data_len()
    }

    /// Full on-disk footprint including tail and alignment padding.
    pub fn record_size(&self) -> u64 {
        dblk_align((self.body_len() + RecordTail::SIZE as u64) as usize) as u64
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[6] = self.record_type.as_u8();
        buf[7] = self.flags;
        buf[8..16].copy_from_slice(&self.tag.to_le_bytes());
        buf[16..24].copy_from_slice(&self.rid.to_le_bytes());
        buf[24..28].copy_from_slice(&self.xid_len.to_le_bytes());
        // 28..32 reserved
        buf[32..40].copy_from_slice(&self.data_len.to_le_bytes());
        buf[40..48].copy_from_slice(&self.deq_rid.to_le_bytes());
        buf
    }

    /// Decodes a header.
    ///
    /// Returns `Ok(None)` for an all-zero magic, which is how never-written
    /// space reads back.
    pub fn decode(buf: &[u8]) -> FormatResult<Option<Self>> {
        if buf.len() < Self::SIZE {
            return Err(FormatError::Truncated {
                needed: Self::SIZE,
                available: buf.len(),
            });
        }
        let magic = read_u32(buf, 0);
        if magic == 0 {
            return Ok(None);
        }
        if magic != RECORD_MAGIC {
            return Err(FormatError::BadMagic { found: magic });
        }
        let version = read_u16(buf, 4);
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let record_type =
            RecordType::from_u8(buf[6]).ok_or(FormatError::UnknownRecordType(buf[6]))?;

        Ok(Some(Self {
            record_type,
            flags: buf[7],
            tag: read_u64(buf, 8),
            rid: read_u64(buf, 16),
            xid_len: read_u32(buf, 24),
            data_len: read_u64(buf, 32),
            deq_rid: read_u64(buf, 40),
        }))
    }
}

/// Record trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTail {
    pub checksum: u32,
    pub rid: u64,
}

impl RecordTail {
    pub const SIZE: usize = 12;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.checksum.to_le_bytes());
        buf[4..12].copy_from_slice(&self.rid.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> FormatResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(FormatError::Truncated {
                needed: Self::SIZE,
                available: buf.len(),
            });
        }
        Ok(Self {
            checksum: read_u32(buf, 0),
            rid: read_u64(buf, 4),
        })
    }
}

/// Encodes a complete record: header, xid, stored data, tail and padding.
///
/// `data` must be empty for records that store no payload.
pub fn encode_record(header: &RecordHeader, xid: &[u8], data: &[u8]) -> Vec<u8> {
    debug_assert_eq!(xid.len(), header.xid_len as usize);
    debug_assert_eq!(data.len() as u64, header.stored_data_len());
    let size = header.record_size() as usize;
    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(xid);
    buf.extend_from_slice(data);
    let tail = RecordTail {
        checksum: compute_checksum(&buf),
        rid: header.rid,
    };
    buf.extend_from_slice(&tail.encode());
    buf.resize(size, 0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DBLK_SIZE;

    #[test]
    fn test_record_type_values() {
        for value in 1..=5u8 {
            let rt = RecordType::from_u8(value).unwrap();
            assert_eq!(rt.as_u8(), value);
        }
        assert!(RecordType::from_u8(0).is_none());
        assert!(RecordType::from_u8(6).is_none());
    }

    #[test]
    fn test_boundary_types() {
        assert!(RecordType::TxnCommit.is_txn_boundary());
        assert!(RecordType::TxnAbort.is_txn_boundary());
        assert!(!RecordType::TxnPrepare.is_txn_boundary());
        assert!(!RecordType::Enqueue.is_txn_boundary());
    }

    #[test]
    fn test_header_decode_of_zeroes_is_empty() {
        let zeroes = [0u8; RecordHeader::SIZE];
        assert_eq!(RecordHeader::decode(&zeroes).unwrap(), None);
    }

    #[test]
    fn test_header_decode_rejects_garbage() {
        let mut buf = RecordHeader::enqueue(7, 1, 0, 10, 0).encode();
        buf[0] ^= 0xff;
        assert!(matches!(
            RecordHeader::decode(&buf),
            Err(FormatError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_header_decode_short_buffer() {
        assert!(matches!(
            RecordHeader::decode(&[1, 2, 3]),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_external_record_stores_no_payload() {
        let local = RecordHeader::enqueue(1, 1, 4, 1000, 0);
        let external = RecordHeader::enqueue(1, 1, 4, 1000, FLAG_EXTERNAL);
        assert_eq!(local.stored_data_len(), 1000);
        assert_eq!(external.stored_data_len(), 0);
        assert_eq!(external.record_size(), DBLK_SIZE as u64);
    }

    #[test]
    fn test_record_size_is_aligned() {
        let header = RecordHeader::enqueue(1, 9, 3, 200, FLAG_TRANSIENT);
        assert_eq!(header.record_size() % DBLK_SIZE as u64, 0);
        assert!(header.record_size() >= header.body_len() + RecordTail::SIZE as u64);
        assert!(header.is_transient());
        assert!(!header.is_external());
    }

    #[test]
    fn test_encoded_record_is_aligned_and_verifiable() {
        let header = RecordHeader::enqueue(5, 3, 2, 4, 0);
        let buf = encode_record(&header, b"t1", b"body");
        assert_eq!(buf.len() as u64, header.record_size());
        let body_len = header.body_len() as usize;
        let tail = RecordTail::decode(&buf[body_len..]).unwrap();
        assert_eq!(tail.rid, 3);
        assert_eq!(tail.checksum, compute_checksum(&buf[..body_len]));
    }

    #[test]
    fn test_dequeue_header_fields() {
        let header = RecordHeader::dequeue(3, 12, 0, 5, FLAG_TXN_COML_COMMIT);
        let decoded = RecordHeader::decode(&header.encode()).unwrap().unwrap();
        assert_eq!(decoded.record_type, RecordType::Dequeue);
        assert_eq!(decoded.deq_rid, 5);
        assert!(decoded.txn_coml_commit());
        assert_eq!(decoded.stored_data_len(), 0);
    }
}
