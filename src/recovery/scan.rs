//! Forward scan of one extent's records
//!
//! The scanner walks the data area of an extent record by record. It stops at
//! the first slot that cannot start a record of this extent: never-written
//! space, bytes that are not a record header, or a header carrying another
//! tag (stale data from an earlier use of the file). A record that starts
//! validly but does not verify is reported as torn; whether that is the end
//! of the log or corruption depends on where the extent sits.

use crate::format::{compute_checksum, RecordHeader, RecordTail, SBLK_SIZE};

/// One verified record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScannedRecord {
    pub header: RecordHeader,
    pub xid: Vec<u8>,
    pub data: Vec<u8>,
    /// File offset of the record header.
    pub offset: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Scan {
    Record(ScannedRecord),
    /// No further records in this extent.
    End,
    /// A record of this extent failed verification.
    Torn { offset: u64, reason: String },
}

pub(crate) struct ExtentScanner<'a> {
    buf: &'a [u8],
    tag: u64,
    pos: usize,
}

impl<'a> ExtentScanner<'a> {
    /// `buf` holds the extent's data area, i.e. the file from the end of the
    /// header block onwards.
    pub fn new(buf: &'a [u8], tag: u64) -> Self {
        Self { buf, tag, pos: 0 }
    }

    /// File offset of the next slot.
    pub fn offset(&self) -> u64 {
        (SBLK_SIZE + self.pos) as u64
    }

    pub fn next_record(&mut self) -> Scan {
        let rest = &self.buf[self.pos..];
        if rest.len() < RecordHeader::SIZE {
            return Scan::End;
        }
        let header = match RecordHeader::decode(rest) {
            Ok(Some(header)) => header,
            Ok(None) | Err(_) => return Scan::End,
        };
        if header.tag != self.tag {
            return Scan::End;
        }

        let offset = self.offset();
        if header.stored_data_len() > rest.len() as u64 || header.xid_len as usize > rest.len() {
            return self.torn(offset, format!("record {} runs past extent end", header.rid));
        }
        let size = header.record_size();
        if size > rest.len() as u64 {
            return self.torn(offset, format!("record {} runs past extent end", header.rid));
        }
        let body_len = header.body_len() as usize;
        let tail = match RecordTail::decode(&rest[body_len..]) {
            Ok(tail) => tail,
            Err(e) => return self.torn(offset, e.to_string()),
        };
        if tail.rid != header.rid {
            return self.torn(
                offset,
                format!("tail rid {} does not match header rid {}", tail.rid, header.rid),
            );
        }
        if compute_checksum(&rest[..body_len]) != tail.checksum {
            return self.torn(offset, format!("checksum mismatch in record {}", header.rid));
        }

        let xid_end = RecordHeader::SIZE + header.xid_len as usize;
        let record = ScannedRecord {
            header,
            xid: rest[RecordHeader::SIZE..xid_end].to_vec(),
            data: rest[xid_end..body_len].to_vec(),
            offset,
        };
        self.pos += size as usize;
        Scan::Record(record)
    }

    fn torn(&mut self, offset: u64, reason: String) -> Scan {
        // Nothing after a torn record is trusted.
        self.pos = self.buf.len();
        Scan::Torn { offset, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{encode_record, RecordType, DBLK_SIZE, FLAG_EXTERNAL};

    const TAG: u64 = 0xfeed;

    fn enqueue(rid: u64, data: &[u8]) -> Vec<u8> {
        encode_record(
            &RecordHeader::enqueue(TAG, rid, 0, data.len() as u64, 0),
            b"",
            data,
        )
    }

    fn area(records: &[Vec<u8>], len: usize) -> Vec<u8> {
        let mut buf: Vec<u8> = records.concat();
        buf.resize(len, 0);
        buf
    }

    fn expect_record(scan: Scan) -> ScannedRecord {
        match scan {
            Scan::Record(record) => record,
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_scan_stops_at_unwritten_space() {
        let buf = area(&[enqueue(1, b"a"), enqueue(2, b"bb")], 4096);
        let mut scanner = ExtentScanner::new(&buf, TAG);

        let first = expect_record(scanner.next_record());
        assert_eq!(first.header.rid, 1);
        assert_eq!(first.data, b"a");
        assert_eq!(first.offset, SBLK_SIZE as u64);

        let second = expect_record(scanner.next_record());
        assert_eq!(second.offset, (SBLK_SIZE + DBLK_SIZE) as u64);
        assert_eq!(scanner.next_record(), Scan::End);
    }

    #[test]
    fn test_scan_stops_at_stale_tag() {
        let stale = encode_record(&RecordHeader::enqueue(TAG + 1, 9, 0, 1, 0), b"", b"x");
        let buf = area(&[enqueue(1, b"a"), stale], 4096);
        let mut scanner = ExtentScanner::new(&buf, TAG);
        expect_record(scanner.next_record());
        assert_eq!(scanner.next_record(), Scan::End);
    }

    #[test]
    fn test_scan_reports_torn_record() {
        let mut second = enqueue(2, &[5u8; 300]);
        second[RecordHeader::SIZE + 10] ^= 0xff;
        let buf = area(&[enqueue(1, b"a"), second, enqueue(3, b"c")], 4096);
        let mut scanner = ExtentScanner::new(&buf, TAG);
        expect_record(scanner.next_record());
        assert!(matches!(scanner.next_record(), Scan::Torn { .. }));
        // Scanning does not resume past a torn record.
        assert_eq!(scanner.next_record(), Scan::End);
    }

    #[test]
    fn test_record_past_end_is_torn() {
        let record = enqueue(1, &[1u8; 500]);
        let buf = record[..256].to_vec();
        let mut scanner = ExtentScanner::new(&buf, TAG);
        assert!(matches!(scanner.next_record(), Scan::Torn { .. }));
    }

    #[test]
    fn test_txn_and_external_records() {
        let txn = encode_record(&RecordHeader::enqueue(TAG, 1, 2, 1000, FLAG_EXTERNAL), b"t1", b"");
        let commit = encode_record(&RecordHeader::txn(RecordType::TxnCommit, TAG, 2, 2), b"t1", b"");
        let buf = area(&[txn, commit], 4096);
        let mut scanner = ExtentScanner::new(&buf, TAG);

        let first = expect_record(scanner.next_record());
        assert_eq!(first.xid, b"t1");
        assert!(first.data.is_empty());
        assert_eq!(first.header.data_len, 1000);

        let second = expect_record(scanner.next_record());
        assert_eq!(second.header.record_type, RecordType::TxnCommit);
    }
}
