//! # Script Invocation
//!
//! Purpose: Run server-side scripts and keep two kinds of failure apart:
//! transport/protocol failures are `Err`, while a failure the script itself
//! reports (an error reply such as `LIMIT_EXCEEDED`) is a
//! `ScriptResult::Failure` value.

use std::sync::Mutex;

use bytes::Bytes;
use tracing::debug;

use crate::cmd::{Cmd, ToArg};
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult, ServerError};
use crate::reply::{FromReply, Reply};

/// Failure reported by the script or the scripting engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFailure {
    pub kind: String,
    pub detail: String,
}

impl From<ServerError> for ScriptFailure {
    fn from(err: ServerError) -> Self {
        ScriptFailure {
            kind: err.kind,
            detail: err.detail,
        }
    }
}

/// Outcome of a script run.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptResult {
    Success(Reply),
    Failure(ScriptFailure),
}

impl ScriptResult {
    fn from_reply(reply: Reply) -> Self {
        match reply {
            Reply::Error(err) => ScriptResult::Failure(err.into()),
            other => ScriptResult::Success(other),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ScriptResult::Success(_))
    }

    /// Failure kind, if the script failed.
    pub fn failure_kind(&self) -> Option<&str> {
        match self {
            ScriptResult::Failure(failure) => Some(&failure.kind),
            ScriptResult::Success(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Reply, ScriptFailure> {
        match self {
            ScriptResult::Success(reply) => Ok(reply),
            ScriptResult::Failure(failure) => Err(failure),
        }
    }

    /// Converts a success payload; a failure stays a failure.
    pub fn typed<T: FromReply>(self) -> ClientResult<Result<T, ScriptFailure>> {
        match self {
            ScriptResult::Success(reply) => T::from_reply(reply).map(Ok),
            ScriptResult::Failure(failure) => Ok(Err(failure)),
        }
    }
}

/// Script source plus key and argument lists, sent with `EVAL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInvocation {
    source: String,
    keys: Vec<Bytes>,
    args: Vec<Bytes>,
}

impl ScriptInvocation {
    pub fn new(source: impl Into<String>) -> Self {
        ScriptInvocation {
            source: source.into(),
            keys: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn key<K: ToArg>(mut self, key: K) -> Self {
        self.keys.push(key.to_arg());
        self
    }

    pub fn arg<A: ToArg>(mut self, arg: A) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn keys(&self) -> &[Bytes] {
        &self.keys
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn to_cmd(&self) -> Cmd {
        Cmd::eval(&self.source, &self.keys, &self.args)
    }

    /// Runs the script with `EVAL`.
    pub fn invoke(&self, conn: &mut Connection) -> ClientResult<ScriptResult> {
        let reply = conn.execute(&self.to_cmd())?;
        Ok(ScriptResult::from_reply(reply))
    }
}

/// A script that is loaded once and then run by digest with `EVALSHA`.
///
/// If the store forgot the script (`NOSCRIPT`, e.g. after `SCRIPT FLUSH`),
/// it is loaded again and the call retried once.
#[derive(Debug)]
pub struct Script {
    source: String,
    sha: Mutex<Option<String>>,
}

impl Script {
    pub fn new(source: impl Into<String>) -> Self {
        Script {
            source: source.into(),
            sha: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Digest returned by the last successful `SCRIPT LOAD`.
    pub fn sha(&self) -> Option<String> {
        self.sha_slot().clone()
    }

    /// Loads the script into the store's cache and remembers its digest.
    pub fn load(&self, conn: &mut Connection) -> ClientResult<String> {
        let sha = String::from_reply(conn.execute(&Cmd::script_load(&self.source))?)?;
        *self.sha_slot() = Some(sha.clone());
        debug!(sha = %sha, "script loaded");
        Ok(sha)
    }

    pub fn invoke<K: ToArg, A: ToArg>(
        &self,
        conn: &mut Connection,
        keys: &[K],
        args: &[A],
    ) -> ClientResult<ScriptResult> {
        let sha = match self.sha() {
            Some(sha) => sha,
            None => self.load(conn)?,
        };

        let result = ScriptResult::from_reply(conn.execute(&Cmd::evalsha(&sha, keys, args))?);
        if result.failure_kind() != Some("NOSCRIPT") {
            return Ok(result);
        }

        debug!(sha = %sha, "script missing from store cache, reloading");
        let sha = self.load(conn)?;
        Ok(ScriptResult::from_reply(
            conn.execute(&Cmd::evalsha(&sha, keys, args))?,
        ))
    }

    fn sha_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.sha
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clone for Script {
    fn clone(&self) -> Self {
        Script {
            source: self.source.clone(),
            sha: Mutex::new(self.sha()),
        }
    }
}

/// Helper used by `KVClient` when a script must yield a typed value.
pub(crate) fn expect_success<T: FromReply>(result: ScriptResult) -> ClientResult<T> {
    match result {
        ScriptResult::Success(reply) => T::from_reply(reply),
        ScriptResult::Failure(failure) => Err(ClientError::Server(ServerError {
            kind: failure.kind,
            detail: failure.detail,
        })),
    }
}
