//! Binary frame format for [`Batch`]es.
//!
//! ```text
//! [u32 magic "PLNX"] [u32 version] [u32 record count] [u32 context count]
//! context entries:   [u16 key len][key][u16 value len][value]
//! for each record:   [u32 metadata count][metadata entries][u32 payload len][payload]
//! ```
//!
//! All integers are big-endian. Decoding slices payloads out of the input
//! buffer instead of copying them.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::batch::{Batch, Record};

/// "PLNX"
pub const MAGIC: u32 = 0x504C_4E58;
pub const VERSION: u32 = 1;
pub const HEADER_LEN: usize = 16;

/// Smallest possible encoded map entry: two empty length-prefixed strings.
const MIN_ENTRY_LEN: usize = 4;
/// Smallest possible encoded record: no metadata, empty payload.
const MIN_RECORD_LEN: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("frame too short: {len} bytes, header needs {HEADER_LEN}")]
    TooShort { len: usize },

    #[error("invalid magic number {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u32),

    #[error("{field} at offset {offset} extends beyond end of frame")]
    Truncated { field: &'static str, offset: usize },

    #[error("{field} at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str, offset: usize },

    #[error("{field} is too long to encode ({len})")]
    FieldTooLong { field: &'static str, len: usize },
}

/// Encodes a batch into a single frame.
///
/// Only fails for values the frame cannot represent: strings longer than
/// `u16::MAX` bytes, payloads or counts larger than `u32::MAX`.
pub fn encode(batch: &Batch) -> Result<Bytes, FormatError> {
    let mut buf = BytesMut::with_capacity(encoded_len(batch));

    buf.put_u32(MAGIC);
    buf.put_u32(VERSION);
    buf.put_u32(to_u32("record count", batch.records.len())?);
    buf.put_u32(to_u32("context count", batch.context.len())?);
    put_map(&mut buf, &batch.context, "context")?;

    for record in &batch.records {
        buf.put_u32(to_u32("metadata count", record.metadata.len())?);
        put_map(&mut buf, &record.metadata, "metadata")?;
        buf.put_u32(to_u32("payload", record.payload.len())?);
        buf.put_slice(&record.payload);
    }

    Ok(buf.freeze())
}

/// Decodes a frame. Record payloads share `frame`'s allocation.
///
/// Either the whole batch is returned or an error; never a partial batch.
pub fn decode(frame: Bytes) -> Result<Batch, FormatError> {
    if frame.len() < HEADER_LEN {
        return Err(FormatError::TooShort { len: frame.len() });
    }

    let mut r = FrameReader { data: frame, offset: 0 };

    let magic = r.u32("magic")?;
    if magic != MAGIC {
        return Err(FormatError::BadMagic(magic));
    }
    let version = r.u32("version")?;
    if version != VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    let record_count = r.u32("record count")? as usize;
    let context_count = r.u32("context count")? as usize;

    let context = r.map(context_count, "context")?;

    let mut records = Vec::with_capacity(record_count.min(r.remaining() / MIN_RECORD_LEN));
    for _ in 0..record_count {
        let metadata_count = r.u32("metadata count")? as usize;
        let metadata = r.map(metadata_count, "metadata")?;
        let payload_len = r.u32("payload length")? as usize;
        let payload = r.take(payload_len, "payload")?;
        records.push(Record { metadata, payload });
    }

    Ok(Batch { records, context })
}

/// Exact size of the frame `encode` produces for `batch`.
pub fn encoded_len(batch: &Batch) -> usize {
    fn map_len(map: &HashMap<String, String>) -> usize {
        map.iter().map(|(k, v)| MIN_ENTRY_LEN + k.len() + v.len()).sum()
    }
    HEADER_LEN
        + map_len(&batch.context)
        + batch
            .records
            .iter()
            .map(|r| MIN_RECORD_LEN + map_len(&r.metadata) + r.payload.len())
            .sum::<usize>()
}

fn to_u32(field: &'static str, len: usize) -> Result<u32, FormatError> {
    u32::try_from(len).map_err(|_| FormatError::FieldTooLong { field, len })
}

fn put_map(
    buf: &mut BytesMut,
    map: &HashMap<String, String>,
    field: &'static str,
) -> Result<(), FormatError> {
    for (key, value) in map {
        put_str(buf, key, field)?;
        put_str(buf, value, field)?;
    }
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str, field: &'static str) -> Result<(), FormatError> {
    let len = u16::try_from(s.len()).map_err(|_| FormatError::FieldTooLong { field, len: s.len() })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

struct FrameReader {
    data: Bytes,
    offset: usize,
}

impl FrameReader {
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<Bytes, FormatError> {
        if len > self.remaining() {
            return Err(FormatError::Truncated { field, offset: self.offset });
        }
        let out = self.data.slice(self.offset..self.offset + len);
        self.offset += len;
        Ok(out)
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, FormatError> {
        let raw = self.take(2, field)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, FormatError> {
        let raw = self.take(4, field)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn string(&mut self, field: &'static str) -> Result<String, FormatError> {
        let len = self.u16(field)? as usize;
        let offset = self.offset;
        let raw = self.take(len, field)?;
        std::str::from_utf8(&raw)
            .map(str::to_owned)
            .map_err(|_| FormatError::InvalidUtf8 { field, offset })
    }

    fn map(&mut self, count: usize, field: &'static str) -> Result<HashMap<String, String>, FormatError> {
        let mut map = HashMap::with_capacity(count.min(self.remaining() / MIN_ENTRY_LEN));
        for _ in 0..count {
            let key = self.string(field)?;
            let value = self.string(field)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mysql_batch() -> Batch {
        Batch::new(vec![
            Record::new(r#"{"id":1}"#).with_metadata("source", "mysql"),
            Record::new(r#"{"id":2}"#).with_metadata("source", "mysql"),
        ])
        .with_context("tenant_id", "t1")
    }

    #[test]
    fn decodes_what_it_encodes() {
        let original = mysql_batch();
        let frame = encode(&original).unwrap();
        let decoded = decode(frame).unwrap();

        assert_eq!(decoded.records[0].payload, Bytes::from_static(br#"{"id":1}"#));
        assert_eq!(decoded.records[1].payload, Bytes::from_static(br#"{"id":2}"#));
        assert_eq!(decoded.context["tenant_id"], "t1");
        assert_eq!(decoded, original);
    }

    #[test]
    fn encoded_len_is_exact() {
        let batch = mysql_batch();
        assert_eq!(encode(&batch).unwrap().len(), encoded_len(&batch));
    }

    #[test]
    fn empty_batch_is_header_only() {
        let frame = encode(&Batch::default()).unwrap();
        assert_eq!(frame.len(), HEADER_LEN);
        let decoded = decode(frame).unwrap();
        assert!(decoded.is_empty());
        assert!(decoded.context.is_empty());
    }

    #[test]
    fn payload_is_sliced_from_frame() {
        let frame = encode(&mysql_batch()).unwrap();
        let range = frame.as_ptr_range();
        let decoded = decode(frame.clone()).unwrap();
        for record in &decoded.records {
            assert!(range.contains(&record.payload.as_ptr()));
        }
    }

    #[test]
    fn rejects_mismatched_magic() {
        let mut data = [0u8; 16];
        data[7] = 1;
        let err = decode(Bytes::copy_from_slice(&data)).unwrap_err();
        assert_eq!(err, FormatError::BadMagic(0));
    }

    #[test]
    fn rejects_short_input() {
        let err = decode(Bytes::from_static(&[0x50, 0x4C, 0x4E])).unwrap_err();
        assert_eq!(err, FormatError::TooShort { len: 3 });
    }

    #[test]
    fn rejects_unknown_version() {
        let mut data = BytesMut::new();
        data.put_u32(MAGIC);
        data.put_u32(2);
        data.put_u32(0);
        data.put_u32(0);
        assert_eq!(decode(data.freeze()).unwrap_err(), FormatError::UnsupportedVersion(2));
    }

    #[test]
    fn rejects_payload_longer_than_frame() {
        let mut data = BytesMut::new();
        data.put_u32(MAGIC);
        data.put_u32(VERSION);
        data.put_u32(1);
        data.put_u32(0);
        data.put_u32(0);
        data.put_u32(1_000);
        data.put_slice(b"short");
        assert!(matches!(
            decode(data.freeze()),
            Err(FormatError::Truncated { field: "payload", .. })
        ));
    }

    #[test]
    fn huge_counts_do_not_preallocate() {
        let mut data = BytesMut::new();
        data.put_u32(MAGIC);
        data.put_u32(VERSION);
        data.put_u32(u32::MAX);
        data.put_u32(u32::MAX);
        assert!(matches!(decode(data.freeze()), Err(FormatError::Truncated { .. })));
    }

    #[test]
    fn every_truncation_fails_cleanly() {
        let frame = encode(&mysql_batch()).unwrap();
        for len in 0..frame.len() {
            assert!(decode(frame.slice(..len)).is_err(), "prefix of {len} bytes decoded");
        }
    }

    #[test]
    fn rejects_invalid_utf8_keys() {
        let mut data = BytesMut::new();
        data.put_u32(MAGIC);
        data.put_u32(VERSION);
        data.put_u32(0);
        data.put_u32(1);
        data.put_u16(2);
        data.put_slice(&[0xff, 0xfe]);
        data.put_u16(0);
        assert_eq!(
            decode(data.freeze()).unwrap_err(),
            FormatError::InvalidUtf8 { field: "context", offset: 18 }
        );
    }

    #[test]
    fn refuses_to_encode_oversized_keys() {
        let key = "k".repeat(u16::MAX as usize + 1);
        let batch = Batch::default().with_context(key, "v");
        assert!(matches!(
            encode(&batch),
            Err(FormatError::FieldTooLong { field: "context", .. })
        ));
    }
}
