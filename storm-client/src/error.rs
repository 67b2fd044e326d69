//! Error taxonomy for the client.
//!
//! Transport and protocol failures propagate to the immediate caller.
//! Conflicts are retried by the transaction coordinator and only show up here
//! once a retry bound is exhausted. Precondition failures and script-reported
//! failures are never errors; see `TxOutcome` and `ScriptResult`.

use std::fmt;

use thiserror::Error;

use crate::transaction::TxState;

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing. Never retried internally.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),
    /// Malformed reply framing. Fatal to the connection that produced it.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The store answered with an error reply.
    #[error("server error: {0}")]
    Server(ServerError),
    /// Reply shape did not match what the call site asked for.
    #[error("unexpected response: expected {expected}, found {found}")]
    UnexpectedResponse {
        expected: &'static str,
        found: &'static str,
    },
    /// Pool is at capacity and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Address could not be resolved into a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// The connection was shut down or broken by an earlier failure.
    #[error("connection closed")]
    Closed,
    /// Nothing arrived within the requested wait.
    #[error("timed out")]
    Timeout,
    /// Every allowed transaction attempt lost to a concurrent writer.
    #[error("transaction conflicted on all {attempts} attempts")]
    TransactionConflictExceeded { attempts: u32 },
    /// A transaction session was driven out of order.
    #[error("invalid transaction state: expected {expected}, found {actual}")]
    InvalidState { expected: &'static str, actual: TxState },
    /// A call was made with arguments it cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Configuration could not be loaded or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns true for failures that leave the underlying connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_) | ClientError::Protocol(_) | ClientError::Closed
        )
    }
}

/// Error reply reported by the store, split into kind and detail.
///
/// `-WRONGTYPE Operation against a key` becomes kind `WRONGTYPE` and detail
/// `Operation against a key`. A bare `-LIMIT_EXCEEDED` has an empty detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub kind: String,
    pub detail: String,
}

impl ServerError {
    /// Parses a raw error line (without the leading `-`).
    pub fn parse(line: &[u8]) -> Self {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        match text.split_once(' ') {
            Some((kind, detail)) => ServerError {
                kind: kind.to_string(),
                detail: detail.trim().to_string(),
            },
            None => ServerError {
                kind: text.to_string(),
                detail: String::new(),
            },
        }
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind.eq_ignore_ascii_case(kind)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{} {}", self.kind, self.detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kind_and_detail() {
        let err = ServerError::parse(b"WRONGTYPE Operation against a key");
        assert_eq!(err.kind, "WRONGTYPE");
        assert_eq!(err.detail, "Operation against a key");
        assert_eq!(err.to_string(), "WRONGTYPE Operation against a key");
    }

    #[test]
    fn parses_bare_kind() {
        let err = ServerError::parse(b"LIMIT_EXCEEDED");
        assert!(err.is_kind("limit_exceeded"));
        assert!(err.detail.is_empty());
    }

    #[test]
    fn fatal_classification() {
        assert!(ClientError::Closed.is_fatal());
        assert!(ClientError::Protocol("bad".into()).is_fatal());
        assert!(!ClientError::PoolExhausted.is_fatal());
        assert!(!ClientError::TransactionConflictExceeded { attempts: 3 }.is_fatal());
    }
}
