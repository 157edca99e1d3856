//! Decoder for the `application/vnd.amazon.eventstream` framing used by
//! Bedrock streaming responses.
//!
//! Frame layout (big-endian):
//!
//! ```text
//! | total len u32 | headers len u32 | prelude crc u32 | headers | payload | message crc u32 |
//! ```
//!
//! The prelude CRC covers the first 8 bytes, the message CRC everything
//! before it.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{CoreResult, LlmError};

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;
const MIN_FRAME_LEN: usize = PRELUDE_LEN + CRC_LEN;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Bytes(Bytes),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: HeaderValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub headers: Vec<Header>,
    pub payload: Bytes,
}

impl Message {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|h| match &h.value {
            HeaderValue::String(s) if h.name == name => Some(s.as_str()),
            _ => None,
        })
    }
}

fn protocol(msg: impl Into<String>) -> LlmError {
    LlmError::Protocol(msg.into())
}

/// Incremental decoder: feed body chunks with `push`, drain frames with
/// `next_message`.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buf: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, `None` if more bytes are needed.
    pub fn next_message(&mut self) -> CoreResult<Option<Message>> {
        if self.buf.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total_len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        let headers_len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        let prelude_crc = u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]);

        if crc32fast::hash(&self.buf[..8]) != prelude_crc {
            return Err(protocol("event stream prelude checksum mismatch"));
        }
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_len) {
            return Err(protocol(format!("event stream frame length {total_len} out of range")));
        }
        if headers_len > total_len - MIN_FRAME_LEN {
            return Err(protocol("event stream headers exceed frame"));
        }
        if self.buf.len() < total_len {
            return Ok(None);
        }

        let frame = self.buf.split_to(total_len).freeze();
        let body_end = total_len - CRC_LEN;
        let message_crc = u32::from_be_bytes([
            frame[body_end],
            frame[body_end + 1],
            frame[body_end + 2],
            frame[body_end + 3],
        ]);
        if crc32fast::hash(&frame[..body_end]) != message_crc {
            return Err(protocol("event stream message checksum mismatch"));
        }

        let headers_end = PRELUDE_LEN + headers_len;
        let headers = decode_headers(&frame[PRELUDE_LEN..headers_end])?;
        let payload = frame.slice(headers_end..body_end);
        Ok(Some(Message { headers, payload }))
    }
}

fn take<'a>(cur: &mut &'a [u8], n: usize) -> CoreResult<&'a [u8]> {
    if cur.len() < n {
        return Err(protocol("event stream header truncated"));
    }
    let (head, tail) = cur.split_at(n);
    *cur = tail;
    Ok(head)
}

fn decode_headers(mut cur: &[u8]) -> CoreResult<Vec<Header>> {
    let mut out = Vec::new();
    while cur.has_remaining() {
        let name_len = take(&mut cur, 1)?[0] as usize;
        let name = String::from_utf8(take(&mut cur, name_len)?.to_vec())
            .map_err(|_| protocol("event stream header name is not utf-8"))?;
        let kind = take(&mut cur, 1)?[0];
        let value = match kind {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => HeaderValue::Byte(take(&mut cur, 1)?.get_i8()),
            3 => HeaderValue::Int16(take(&mut cur, 2)?.get_i16()),
            4 => HeaderValue::Int32(take(&mut cur, 4)?.get_i32()),
            5 => HeaderValue::Int64(take(&mut cur, 8)?.get_i64()),
            6 | 7 => {
                let len = take(&mut cur, 2)?.get_u16() as usize;
                let raw = take(&mut cur, len)?;
                if kind == 6 {
                    HeaderValue::Bytes(Bytes::copy_from_slice(raw))
                } else {
                    HeaderValue::String(
                        String::from_utf8(raw.to_vec())
                            .map_err(|_| protocol("event stream header value is not utf-8"))?,
                    )
                }
            }
            8 => HeaderValue::Timestamp(take(&mut cur, 8)?.get_i64()),
            9 => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(take(&mut cur, 16)?);
                HeaderValue::Uuid(uuid)
            }
            other => return Err(protocol(format!("unknown event stream header type {other}"))),
        };
        out.push(Header { name, value });
    }
    Ok(out)
}

/// Test-side encoder for string-valued headers.
#[cfg(test)]
pub(crate) fn encode_message(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut hdr = Vec::new();
    for (name, value) in headers {
        hdr.push(name.len() as u8);
        hdr.extend_from_slice(name.as_bytes());
        hdr.push(7);
        hdr.extend_from_slice(&(value.len() as u16).to_be_bytes());
        hdr.extend_from_slice(value.as_bytes());
    }
    let total = (MIN_FRAME_LEN + hdr.len() + payload.len()) as u32;
    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&(hdr.len() as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&out[..8]);
    out.extend_from_slice(&prelude_crc.to_be_bytes());
    out.extend_from_slice(&hdr);
    out.extend_from_slice(payload);
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}
