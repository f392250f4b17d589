//! Record framing shared by the file store and snapshot transfer.
//!
//! Frame: `[len u32 LE][crc32c u32 LE][body]`, crc over the body.
//! Body: kind, seq, timestamp, then length-prefixed subject, headers and
//! payload. Tombstones carry only kind + seq + timestamp.

use bytes::Bytes;

use crate::{HeaderMap, Message, Seq, StoreError, UnixMillis};

pub const REC_MSG: u8 = 1;
pub const REC_TOMBSTONE: u8 = 2;

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub kind: u8,
    pub seq: Seq,
    pub timestamp: UnixMillis,
    pub subject: String,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

impl Record {
    pub fn message(msg: &Message) -> Self {
        Self {
            kind: REC_MSG,
            seq: msg.seq,
            timestamp: msg.timestamp,
            subject: msg.subject.clone(),
            headers: msg.headers.clone(),
            payload: msg.payload.clone(),
        }
    }

    pub fn tombstone(seq: Seq, timestamp: UnixMillis) -> Self {
        Self {
            kind: REC_TOMBSTONE,
            seq,
            timestamp,
            subject: String::new(),
            headers: HeaderMap::new(),
            payload: Bytes::new(),
        }
    }

    pub fn into_message(self) -> Message {
        Message {
            seq: self.seq,
            subject: self.subject,
            headers: self.headers,
            payload: self.payload,
            timestamp: self.timestamp,
        }
    }
}

pub fn encoded_headers_len(headers: &HeaderMap) -> usize {
    if headers.is_empty() {
        return 0;
    }
    let mut n = 2;
    for (name, values) in headers {
        n += 2 + name.len() + 2;
        for v in values {
            n += 4 + v.len();
        }
    }
    n
}

pub fn encode_headers(headers: &HeaderMap) -> Vec<u8> {
    if headers.is_empty() {
        return Vec::new();
    }
    let mut buf = Vec::with_capacity(encoded_headers_len(headers));
    buf.extend_from_slice(&(headers.len() as u16).to_le_bytes());
    for (name, values) in headers {
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(&(values.len() as u16).to_le_bytes());
        for v in values {
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v.as_bytes());
        }
    }
    buf
}

pub fn decode_headers(buf: &[u8]) -> Result<HeaderMap, StoreError> {
    if buf.is_empty() {
        return Ok(HeaderMap::new());
    }
    let mut pos = 0usize;
    let count = read_u16(buf, &mut pos)? as usize;
    let mut out = HeaderMap::with_capacity(count);
    for _ in 0..count {
        let name_len = read_u16(buf, &mut pos)? as usize;
        let name = read_str(buf, &mut pos, name_len)?;
        let nvals = read_u16(buf, &mut pos)? as usize;
        let mut values = Vec::with_capacity(nvals);
        for _ in 0..nvals {
            let vlen = read_u32(buf, &mut pos)? as usize;
            values.push(read_str(buf, &mut pos, vlen)?);
        }
        out.push((name, values));
    }
    Ok(out)
}

/// Total frame length for a record, without building it.
pub fn frame_len(rec: &Record) -> usize {
    FRAME_HEADER_LEN + body_len(rec)
}

fn body_len(rec: &Record) -> usize {
    1 + 8 + 8 + 2 + rec.subject.len() + 4 + encoded_headers_len(&rec.headers) + 4 + rec.payload.len()
}

pub fn encode_frame(rec: &Record) -> Vec<u8> {
    let body_len = body_len(rec);
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body_len);
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]); // crc placeholder
    buf.push(rec.kind);
    buf.extend_from_slice(&rec.seq.to_le_bytes());
    buf.extend_from_slice(&rec.timestamp.to_le_bytes());
    buf.extend_from_slice(&(rec.subject.len() as u16).to_le_bytes());
    buf.extend_from_slice(rec.subject.as_bytes());
    let hdrs = encode_headers(&rec.headers);
    buf.extend_from_slice(&(hdrs.len() as u32).to_le_bytes());
    buf.extend_from_slice(&hdrs);
    buf.extend_from_slice(&(rec.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&rec.payload);

    let crc = crc32c::crc32c(&buf[FRAME_HEADER_LEN..]);
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Decode one frame from the front of `buf`.
///
/// `Ok(None)` means the buffer holds only a partial frame (caller should
/// wait for more bytes, or treat it as a truncated tail).
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Record, usize)>, StoreError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if body_len < 1 + 8 + 8 + 2 + 4 + 4 {
        return Err(StoreError::BadRecord(format!(
            "frame body too short: {body_len}"
        )));
    }
    if buf.len() < FRAME_HEADER_LEN + body_len {
        return Ok(None);
    }
    let expected_crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let body = &buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + body_len];
    let actual_crc = crc32c::crc32c(body);
    if actual_crc != expected_crc {
        return Err(StoreError::BadRecord(format!(
            "crc mismatch: expected {expected_crc:#x}, got {actual_crc:#x}"
        )));
    }

    let mut pos = 0usize;
    let kind = body[pos];
    pos += 1;
    if kind != REC_MSG && kind != REC_TOMBSTONE {
        return Err(StoreError::BadRecord(format!("unknown record kind {kind}")));
    }
    let seq = read_u64(body, &mut pos)?;
    let timestamp = read_u64(body, &mut pos)?;
    let subject_len = read_u16(body, &mut pos)? as usize;
    let subject = read_str(body, &mut pos, subject_len)?;
    let hdr_len = read_u32(body, &mut pos)? as usize;
    if pos + hdr_len > body.len() {
        return Err(StoreError::BadRecord("header length out of bounds".into()));
    }
    let headers = decode_headers(&body[pos..pos + hdr_len])?;
    pos += hdr_len;
    let data_len = read_u32(body, &mut pos)? as usize;
    if pos + data_len > body.len() {
        return Err(StoreError::BadRecord("payload length out of bounds".into()));
    }
    let payload = Bytes::copy_from_slice(&body[pos..pos + data_len]);

    Ok(Some((
        Record {
            kind,
            seq,
            timestamp,
            subject,
            headers,
            payload,
        },
        FRAME_HEADER_LEN + body_len,
    )))
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16, StoreError> {
    if *pos + 2 > buf.len() {
        return Err(StoreError::BadRecord("short read (u16)".into()));
    }
    let v = u16::from_le_bytes([buf[*pos], buf[*pos + 1]]);
    *pos += 2;
    Ok(v)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, StoreError> {
    if *pos + 4 > buf.len() {
        return Err(StoreError::BadRecord("short read (u32)".into()));
    }
    let v = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64, StoreError> {
    if *pos + 8 > buf.len() {
        return Err(StoreError::BadRecord("short read (u64)".into()));
    }
    let v = u64::from_le_bytes(buf[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Ok(v)
}

fn read_str(buf: &[u8], pos: &mut usize, len: usize) -> Result<String, StoreError> {
    if *pos + len > buf.len() {
        return Err(StoreError::BadRecord("short read (string)".into()));
    }
    let s = std::str::from_utf8(&buf[*pos..*pos + len])
        .map_err(|e| StoreError::BadRecord(format!("invalid utf8: {e}")))?
        .to_string();
    *pos += len;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record {
            kind: REC_MSG,
            seq: 42,
            timestamp: 1_700_000_000_000,
            subject: "orders.eu.created".into(),
            headers: vec![
                ("Plexus-Msg-Id".into(), vec!["abc123".into()]),
                ("X-Trace".into(), vec!["a".into(), "b".into()]),
            ],
            payload: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn frame_roundtrip() {
        let rec = sample();
        let frame = encode_frame(&rec);
        assert_eq!(frame.len(), frame_len(&rec));
        let (decoded, used) = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(decoded, rec);
    }

    #[test]
    fn partial_frame_yields_none() {
        let frame = encode_frame(&sample());
        for cut in [0, 3, FRAME_HEADER_LEN, frame.len() - 1] {
            assert!(decode_frame(&frame[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn flipped_bit_fails_crc() {
        let mut frame = encode_frame(&sample());
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(
            decode_frame(&frame),
            Err(StoreError::BadRecord(_))
        ));
    }

    #[test]
    fn tombstone_roundtrip() {
        let rec = Record::tombstone(7, 123);
        let (decoded, _) = decode_frame(&encode_frame(&rec)).unwrap().unwrap();
        assert_eq!(decoded.kind, REC_TOMBSTONE);
        assert_eq!(decoded.seq, 7);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn empty_headers_encode_to_nothing() {
        assert!(encode_headers(&HeaderMap::new()).is_empty());
        assert_eq!(encoded_headers_len(&HeaderMap::new()), 0);
        assert!(decode_headers(&[]).unwrap().is_empty());
    }
}
