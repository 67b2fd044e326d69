//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server replies with explicit
//! framing checks, keeping allocations under control.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately;
//!    a peer that hangs up mid-reply is a transport failure.

use std::io::{self, BufRead};

use bytes::{BufMut, Bytes, BytesMut};

use crate::cmd::Cmd;
use crate::error::{ClientError, ClientResult, ServerError};
use crate::reply::Reply;

/// Upper bound on a single bulk payload accepted from the store.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(cmd: &Cmd, out: &mut BytesMut) {
    out.put_u8(b'*');
    push_usize(out, cmd.part_count());
    out.put_slice(b"\r\n");
    push_bulk(out, cmd.name().as_bytes());
    for arg in cmd.arguments() {
        push_bulk(out, arg);
    }
}

fn push_bulk(out: &mut BytesMut, data: &[u8]) {
    out.put_u8(b'$');
    push_usize(out, data.len());
    out.put_slice(b"\r\n");
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

/// Reads one RESP value from the buffered reader.
pub fn read_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<Reply> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ClientError::Protocol("empty reply line".into()));
    }

    match line_buf[0] {
        b'+' => Ok(Reply::Status(
            String::from_utf8_lossy(&line_buf[1..]).into_owned(),
        )),
        b'-' => Ok(Reply::Error(ServerError::parse(&line_buf[1..]))),
        b':' => Ok(Reply::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_bulk_len(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            parse_array_len(reader, len, line_buf)
        }
        other => Err(ClientError::Protocol(format!(
            "unknown reply type byte 0x{:02x}",
            other
        ))),
    }
}

fn parse_bulk_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<Reply> {
    if len < 0 {
        return Ok(Reply::Nil);
    }
    if len > MAX_BULK_LEN {
        return Err(ClientError::Protocol(format!("bulk length {} too large", len)));
    }
    let len = len as usize;
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(ClientError::Protocol("bulk string missing CRLF".into()));
    }

    line_buf.clear();
    Ok(Reply::Bulk(Bytes::from(data)))
}

fn parse_array_len<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
) -> ClientResult<Reply> {
    // `*-1` is how EXEC reports an aborted transaction.
    if len < 0 {
        return Ok(Reply::Nil);
    }

    let mut items = Vec::with_capacity(len.min(1024) as usize);
    for _ in 0..len {
        items.push(read_reply(reader, line_buf)?);
    }
    Ok(Reply::Array(items))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(ClientError::Connection(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        )));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::Protocol("reply line missing CRLF".into()));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    if data.is_empty() {
        return Err(ClientError::Protocol("empty integer".into()));
    }
    let mut negative = false;
    let mut idx = 0;
    if data[0] == b'-' {
        negative = true;
        idx = 1;
    }
    if idx == data.len() {
        return Err(ClientError::Protocol("integer without digits".into()));
    }

    let mut value: i64 = 0;
    while idx < data.len() {
        let b = data[idx];
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol("invalid integer digit".into()));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
        idx += 1;
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut BytesMut, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    buf[..len].reverse();
    out.put_slice(&buf[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(raw: &[u8]) -> ClientResult<Reply> {
        let mut reader = Cursor::new(raw.to_vec());
        let mut line = Vec::new();
        read_reply(&mut reader, &mut line)
    }

    #[test]
    fn encodes_command() {
        let mut buf = BytesMut::new();
        encode_command(&Cmd::get("key"), &mut buf);
        assert_eq!(&buf[..], b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn parses_simple_string() {
        assert_eq!(parse(b"+OK\r\n").unwrap(), Reply::Status("OK".into()));
    }

    #[test]
    fn parses_bulk_string() {
        assert_eq!(
            parse(b"$5\r\nhello\r\n").unwrap(),
            Reply::Bulk(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn parses_null_bulk_and_null_array() {
        assert_eq!(parse(b"$-1\r\n").unwrap(), Reply::Nil);
        assert_eq!(parse(b"*-1\r\n").unwrap(), Reply::Nil);
        assert_eq!(parse(b"*0\r\n").unwrap(), Reply::Array(Vec::new()));
    }

    #[test]
    fn parses_integer() {
        assert_eq!(parse(b":42\r\n").unwrap(), Reply::Integer(42));
        assert_eq!(parse(b":-2\r\n").unwrap(), Reply::Integer(-2));
    }

    #[test]
    fn parses_error() {
        let reply = parse(b"-ERR bad\r\n").unwrap();
        assert_eq!(reply, Reply::Error(ServerError::parse(b"ERR bad")));
    }

    #[test]
    fn parses_nested_array() {
        let reply = parse(b"*2\r\n:1\r\n*1\r\n$2\r\nok\r\n").unwrap();
        assert_eq!(
            reply,
            Reply::Array(vec![
                Reply::Integer(1),
                Reply::Array(vec![Reply::Bulk(Bytes::from_static(b"ok"))]),
            ])
        );
    }

    #[test]
    fn rejects_unknown_type_byte() {
        assert!(matches!(parse(b"?what\r\n"), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn rejects_missing_crlf() {
        assert!(matches!(parse(b":1\n"), Err(ClientError::Protocol(_))));
        assert!(matches!(parse(b"$2\r\nokXX"), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn eof_is_a_connection_error() {
        assert!(matches!(parse(b""), Err(ClientError::Connection(_))));
        assert!(matches!(parse(b"$5\r\nhe"), Err(ClientError::Connection(_))));
    }
}
