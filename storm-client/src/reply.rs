//! # Typed Replies
//!
//! Purpose: Close the set of reply shapes the store can produce and let each
//! call site pick the Rust type it expects.
//!
//! ## Design Principles
//! 1. **Closed Variants**: Every decoded reply is one of six shapes.
//! 2. **Resolve at the Call Site**: `FromReply` turns a `Reply` into the type
//!    the command is known to return; mismatches are errors, not panics.
//! 3. **Errors Stay Values**: `Reply::Error` is data until a typed conversion
//!    decides it is a failure.

use std::collections::HashMap;
use std::hash::Hash;

use bytes::Bytes;

use crate::error::{ClientError, ClientResult, ServerError};

/// Reply value decoded from the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Null bulk string or null array.
    Nil,
    /// :123 responses.
    Integer(i64),
    /// +OK or +PONG style responses.
    Status(String),
    /// $... bulk strings.
    Bulk(Bytes),
    /// *... arrays. Mappings arrive as flat key/value sequences.
    Array(Vec<Reply>),
    /// -ERR ... responses.
    Error(ServerError),
}

impl Reply {
    /// Short name of the variant, used in conversion errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Reply::Nil => "nil",
            Reply::Integer(_) => "integer",
            Reply::Status(_) => "status",
            Reply::Bulk(_) => "bulk",
            Reply::Array(_) => "array",
            Reply::Error(_) => "error",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Returns true for `+OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Status(status) if status == "OK")
    }

    /// Returns the error payload when the reply is an error reply.
    pub fn as_error(&self) -> Option<&ServerError> {
        match self {
            Reply::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Converts into the requested type.
    pub fn into_typed<T: FromReply>(self) -> ClientResult<T> {
        T::from_reply(self)
    }

    /// Turns a flat `[k1, v1, k2, v2, ...]` array into pairs.
    ///
    /// Used for HGETALL and WITHSCORES replies. An odd element count is a
    /// protocol violation.
    pub fn into_pairs<K: FromReply, V: FromReply>(self) -> ClientResult<Vec<(K, V)>> {
        let items = match self {
            Reply::Array(items) => items,
            Reply::Nil => return Ok(Vec::new()),
            other => return Err(reject(other, "array")),
        };
        if items.len() % 2 != 0 {
            return Err(ClientError::Protocol(format!(
                "mapping reply has odd length {}",
                items.len()
            )));
        }

        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            pairs.push((K::from_reply(key)?, V::from_reply(value)?));
        }
        Ok(pairs)
    }
}

/// Conversion from a decoded reply into a call-site type.
pub trait FromReply: Sized {
    fn from_reply(reply: Reply) -> ClientResult<Self>;
}

/// Maps a reply that failed conversion to the matching error.
///
/// Error replies surface as `ClientError::Server`; anything else is a shape
/// mismatch.
pub(crate) fn reject(reply: Reply, expected: &'static str) -> ClientError {
    match reply {
        Reply::Error(err) => ClientError::Server(err),
        other => ClientError::UnexpectedResponse {
            expected,
            found: other.kind_name(),
        },
    }
}

impl FromReply for Reply {
    fn from_reply(reply: Reply) -> ClientResult<Self> {
        Ok(reply)
    }
}

impl FromReply for () {
    fn from_reply(reply: Reply) -> ClientResult<Self> {
        match reply {
            Reply::Error(err) => Err(ClientError::Server(err)),
            _ => Ok(()),
        }
    }
}

impl FromReply for i64 {
    fn from_reply(reply: Reply) -> ClientResult<Self> {
        match reply {
            Reply::Integer(value) => Ok(value),
            // Counters stored with SET come back as bulk text.
            Reply::Bulk(data) => parse_text(&data),
            Reply::Status(text) => parse_text(text.as_bytes()),
            other => Err(reject(other, "integer")),
        }
    }
}

impl FromReply for u64 {
    fn from_reply(reply: Reply) -> ClientResult<Self> {
        let value = i64::from_reply(reply)?;
        u64::try_from(value).map_err(|_| ClientError::UnexpectedResponse {
            expected: "non-negative integer",
            found: "integer",
        })
    }
}

impl FromReply for usize {
    fn from_reply(reply: Reply) -> ClientResult<Self> {
        let value = u64::from_reply(reply)?;
        usize::try_from(value).map_err(|_| ClientError::UnexpectedResponse {
            expected: "usize",
            found: "integer",
        })
    }
}

impl FromReply for f64 {
    fn from_reply(reply: Reply) -> ClientResult<Self> {
        match reply {
            Reply::Integer(value) => Ok(value as f64),
            Reply::Bulk(data) => parse_text(&data),
            Reply::Status(text) => parse_text(text.as_bytes()),
            other => Err(reject(other, "float")),
        }
    }
}

impl FromReply for bool {
    fn from_reply(reply: Reply) -> ClientResult<Self> {
        match reply {
            Reply::Integer(value) => Ok(value != 0),
            Reply::Status(text) => Ok(text == "OK"),
            Reply::Nil => Ok(false),
            other => Err(reject(other, "boolean")),
        }
    }
}

impl FromReply for String {
    fn from_reply(reply: Reply) -> ClientResult<Self> {
        match reply {
            Reply::Bulk(data) => String::from_utf8(data.to_vec())
                .map_err(|_| ClientError::Protocol("bulk reply is not valid utf-8".into())),
            Reply::Status(text) => Ok(text),
            Reply::Integer(value) => Ok(value.to_string()),
            other => Err(reject(other, "text")),
        }
    }
}

impl FromReply for Bytes {
    fn from_reply(reply: Reply) -> ClientResult<Self> {
        match reply {
            Reply::Bulk(data) => Ok(data),
            Reply::Status(text) => Ok(Bytes::from(text)),
            other => Err(reject(other, "bulk")),
        }
    }
}

impl<T: FromReply> FromReply for Option<T> {
    fn from_reply(reply: Reply) -> ClientResult<Self> {
        match reply {
            Reply::Nil => Ok(None),
            other => T::from_reply(other).map(Some),
        }
    }
}

impl<T: FromReply> FromReply for Vec<T> {
    fn from_reply(reply: Reply) -> ClientResult<Self> {
        match reply {
            Reply::Array(items) => items.into_iter().map(T::from_reply).collect(),
            Reply::Nil => Ok(Vec::new()),
            other => Err(reject(other, "array")),
        }
    }
}

impl<K, V> FromReply for HashMap<K, V>
where
    K: FromReply + Eq + Hash,
    V: FromReply,
{
    fn from_reply(reply: Reply) -> ClientResult<Self> {
        Ok(reply.into_pairs::<K, V>()?.into_iter().collect())
    }
}

fn parse_text<T: std::str::FromStr>(data: &[u8]) -> ClientResult<T> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or(ClientError::UnexpectedResponse {
            expected: "numeric text",
            found: "bulk",
        })
}
