//! Client configuration.
//!
//! Values come from `Default`, a JSON document, or `STORM_*` environment
//! variables layered on top of either. Durations are expressed in
//! milliseconds on the outside and as `Duration` in code.

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};
use crate::transaction::RetryPolicy;

/// Configuration for the synchronous client and its pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:6380". Host names are resolved.
    pub addr: String,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional TCP read timeout.
    #[serde(rename = "read_timeout_ms", with = "opt_millis")]
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    #[serde(rename = "write_timeout_ms", with = "opt_millis")]
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    #[serde(rename = "connect_timeout_ms", with = "opt_millis")]
    pub connect_timeout: Option<Duration>,
    /// Attempt bound for optimistic transactions; `None` retries forever.
    pub transaction_max_attempts: Option<u32>,
    /// Pause between conflicting transaction attempts.
    #[serde(rename = "transaction_backoff_ms", with = "opt_millis")]
    pub transaction_backoff: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:6380".to_string(),
            max_idle: 8,
            max_total: 16,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
            transaction_max_attempts: None,
            transaction_backoff: None,
        }
    }
}

impl ClientConfig {
    /// Default configuration pointed at `addr`.
    pub fn with_addr(addr: impl Into<String>) -> Self {
        ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        }
    }

    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json_str(raw: &str) -> ClientResult<Self> {
        let config: ClientConfig =
            serde_json::from_str(raw).map_err(|err| ClientError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| ClientError::Config(format!("{}: {}", path.display(), err)))?;
        Self::from_json_str(&raw)
    }

    /// Defaults overlaid with `STORM_*` environment variables.
    pub fn from_env() -> ClientResult<Self> {
        ClientConfig::default().overlay_env()
    }

    /// Applies `STORM_*` environment variables on top of `self`.
    pub fn overlay_env(self) -> ClientResult<Self> {
        self.overlay(|name| env::var(name).ok())
    }

    fn overlay<F>(mut self, lookup: F) -> ClientResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("STORM_ADDR") {
            self.addr = addr;
        }
        if let Some(value) = parse_var(&lookup, "STORM_MAX_IDLE")? {
            self.max_idle = value;
        }
        if let Some(value) = parse_var(&lookup, "STORM_MAX_TOTAL")? {
            self.max_total = value;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "STORM_READ_TIMEOUT_MS")? {
            self.read_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "STORM_WRITE_TIMEOUT_MS")? {
            self.write_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "STORM_CONNECT_TIMEOUT_MS")? {
            self.connect_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(value) = parse_var(&lookup, "STORM_TX_MAX_ATTEMPTS")? {
            self.transaction_max_attempts = Some(value);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "STORM_TX_BACKOFF_MS")? {
            self.transaction_backoff = Some(Duration::from_millis(ms));
        }
        self.validate()?;
        Ok(self)
    }

    /// Rejects configurations the pool or coordinator cannot honor.
    pub fn validate(&self) -> ClientResult<()> {
        if self.addr.trim().is_empty() {
            return Err(ClientError::Config("addr must not be empty".into()));
        }
        if self.max_total == 0 {
            return Err(ClientError::Config("max_total must be at least 1".into()));
        }
        if self.max_idle > self.max_total {
            return Err(ClientError::Config(format!(
                "max_idle ({}) exceeds max_total ({})",
                self.max_idle, self.max_total
            )));
        }
        if self.transaction_max_attempts == Some(0) {
            return Err(ClientError::Config(
                "transaction_max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Retry policy used by `KVClient::transaction`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.transaction_max_attempts,
            backoff: self.transaction_backoff,
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> ClientResult<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ClientError::Config(format!("{} has invalid value {:?}", name, raw))),
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => ser.serialize_some(&(duration.as_millis() as u64)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(de)?.map(Duration::from_millis))
    }
}
