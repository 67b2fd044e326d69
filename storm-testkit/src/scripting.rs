//! # Script Registry
//!
//! Purpose: Stand in for a server-side script engine. Tests register a Rust
//! handler for a script source; `EVAL`, `EVALSHA` and `SCRIPT` then behave as
//! they would against a real store, including `NOSCRIPT` after a flush.
//!
//! Handlers run while the keyspace lock is held, so a script is atomic with
//! respect to every other command.

use std::collections::HashMap;
use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::commands;
use crate::keyspace::{parse_i64, Keyspace};
use crate::protocol::Value;

/// Handler standing in for a script body.
pub type ScriptHandler = Arc<dyn Fn(&mut ScriptContext<'_>) -> Value + Send + Sync>;

/// What a running script sees: its keys, its arguments and the keyspace.
pub struct ScriptContext<'a> {
    keys: &'a [Vec<u8>],
    args: &'a [Vec<u8>],
    store: &'a mut Keyspace,
}

impl<'a> ScriptContext<'a> {
    pub fn keys(&self) -> &[Vec<u8>] {
        self.keys
    }

    pub fn args(&self) -> &[Vec<u8>] {
        self.args
    }

    pub fn key(&self, index: usize) -> Option<&[u8]> {
        self.keys.get(index).map(|key| key.as_slice())
    }

    /// Argument `index` parsed as an integer.
    pub fn arg_i64(&self, index: usize) -> Option<i64> {
        self.args.get(index).and_then(|arg| parse_i64(arg))
    }

    /// Runs a data command, like `redis.call` in a script body.
    pub fn call(&mut self, parts: &[&[u8]]) -> Value {
        let args: Vec<Vec<u8>> = parts.iter().map(|part| part.to_vec()).collect();
        commands::apply(self.store, &args)
    }
}

/// Registered handlers plus the digest cache that `SCRIPT LOAD` fills.
#[derive(Default)]
pub struct ScriptRegistry {
    handlers: HashMap<String, ScriptHandler>,
    loaded: HashMap<String, String>,
}

impl ScriptRegistry {
    pub fn register(&mut self, source: &str, handler: ScriptHandler) {
        self.handlers.insert(source.to_string(), handler);
    }

    /// Caches `source` and returns its digest.
    pub fn load(&mut self, source: &str) -> String {
        let sha = digest(source);
        self.loaded.insert(sha.clone(), source.to_string());
        sha
    }

    pub fn exists(&self, sha: &str) -> bool {
        self.loaded.contains_key(sha)
    }

    pub fn flush(&mut self) {
        self.loaded.clear();
    }

    /// Resolves `EVAL source`. The source is cached as a side effect.
    pub fn by_source(&mut self, source: &str) -> Result<ScriptHandler, Value> {
        self.load(source);
        self.handlers
            .get(source)
            .cloned()
            .ok_or_else(|| Value::error("ERR no handler registered for script"))
    }

    /// Resolves `EVALSHA sha`.
    pub fn by_sha(&self, sha: &str) -> Result<ScriptHandler, Value> {
        let source = self
            .loaded
            .get(&sha.to_ascii_lowercase())
            .ok_or_else(|| Value::error("NOSCRIPT No matching script. Please use EVAL."))?;
        self.handlers
            .get(source)
            .cloned()
            .ok_or_else(|| Value::error("ERR no handler registered for script"))
    }
}

/// Splits `EVAL`/`EVALSHA` arguments after the script into keys and args.
pub fn split_keys(rest: &[Vec<u8>]) -> Result<(&[Vec<u8>], &[Vec<u8>]), Value> {
    let numkeys = rest
        .first()
        .and_then(|raw| parse_i64(raw))
        .ok_or_else(|| Value::error("ERR value is not an integer or out of range"))?;
    if numkeys < 0 {
        return Err(Value::error("ERR Number of keys can't be negative"));
    }
    let numkeys = numkeys as usize;
    if numkeys > rest.len() - 1 {
        return Err(Value::error(
            "ERR Number of keys can't be greater than number of args",
        ));
    }
    Ok((&rest[1..1 + numkeys], &rest[1 + numkeys..]))
}

/// Runs `handler` with its keys and arguments against `store`.
pub fn run(handler: &ScriptHandler, store: &mut Keyspace, keys: &[Vec<u8>], args: &[Vec<u8>]) -> Value {
    let mut context = ScriptContext { keys, args, store };
    handler(&mut context)
}

/// Lowercase hex SHA-1 of a script source, as `SCRIPT LOAD` reports it.
pub fn digest(source: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}
