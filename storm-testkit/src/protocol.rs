//! # RESP2 Server Codec
//!
//! Purpose: Parse request arrays out of a connection buffer and encode reply
//! values for the test server.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: `parse` returns `Ok(None)` until a whole
//!    request is buffered and consumes nothing in that case.
//! 2. **Strict Framing**: Anything other than an array of bulk strings is a
//!    protocol error; the connection is closed afterwards.

use bytes::{Buf, BytesMut};

const MAX_ARGS: i64 = 1024 * 1024;
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    Protocol,
}

/// Request parser over a growable connection buffer.
#[derive(Debug, Default)]
pub struct RespParser {
    parsed: u64,
}

impl RespParser {
    pub fn new() -> Self {
        RespParser::default()
    }

    /// Number of complete requests parsed so far.
    pub fn parsed(&self) -> u64 {
        self.parsed
    }

    /// Parses one request array, consuming it from `buf` when complete.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        let mut cursor = 0;
        let count = match read_header(buf, &mut cursor, b'*')? {
            Some(count) => count,
            None => return Ok(None),
        };
        if !(0..=MAX_ARGS).contains(&count) {
            return Err(RespError::Protocol);
        }

        let mut args = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = match read_header(buf, &mut cursor, b'$')? {
                Some(len) => len,
                None => return Ok(None),
            };
            if !(0..=MAX_BULK_LEN).contains(&len) {
                return Err(RespError::Protocol);
            }
            let len = len as usize;
            if buf.len() < cursor + len + 2 {
                return Ok(None);
            }
            if &buf[cursor + len..cursor + len + 2] != b"\r\n" {
                return Err(RespError::Protocol);
            }
            args.push(buf[cursor..cursor + len].to_vec());
            cursor += len + 2;
        }

        buf.advance(cursor);
        self.parsed += 1;
        Ok(Some(args))
    }
}

fn read_header(buf: &[u8], cursor: &mut usize, prefix: u8) -> Result<Option<i64>, RespError> {
    if *cursor >= buf.len() {
        return Ok(None);
    }
    if buf[*cursor] != prefix {
        return Err(RespError::Protocol);
    }
    let rest = &buf[*cursor + 1..];
    let end = match rest.windows(2).position(|window| window == b"\r\n") {
        Some(end) => end,
        None => return Ok(None),
    };
    let value = std::str::from_utf8(&rest[..end])
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or(RespError::Protocol)?;
    *cursor += 1 + end + 2;
    Ok(Some(value))
}

/// Reply value produced by command handlers and scripts.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `$-1`
    Nil,
    /// `*-1`, the EXEC conflict reply.
    NilArray,
    Integer(i64),
    Status(String),
    Bulk(Vec<u8>),
    Array(Vec<Value>),
    /// Full error line without the leading `-`, e.g. `ERR syntax error`.
    Error(String),
}

impl Value {
    pub fn ok() -> Self {
        Value::Status("OK".into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Value::Error(message.into())
    }

    pub fn bulk(data: impl AsRef<[u8]>) -> Self {
        Value::Bulk(data.as_ref().to_vec())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::Nil => out.extend_from_slice(b"$-1\r\n"),
            Value::NilArray => out.extend_from_slice(b"*-1\r\n"),
            Value::Integer(value) => push_line(out, b':', value.to_string().as_bytes()),
            Value::Status(text) => push_line(out, b'+', text.as_bytes()),
            Value::Error(text) => push_line(out, b'-', text.as_bytes()),
            Value::Bulk(data) => {
                push_line(out, b'$', data.len().to_string().as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            Value::Array(items) => {
                push_line(out, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }
}

fn push_line(out: &mut Vec<u8>, prefix: u8, body: &[u8]) {
    out.push(prefix);
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
}
