//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API over the store's command surface
//! plus the batching, transaction, scripting and pub/sub layers.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling and protocol details.
//! 2. **One Connection per Call**: Plain commands borrow a pooled connection
//!    for exactly one round trip.
//! 3. **Pinned Work Stays Pinned**: Pipelines and transactions hold a single
//!    pooled connection from start to finish; subscriptions get their own.
//! 4. **Typed at the Edge**: Helpers convert replies with `FromReply`, so an
//!    error reply surfaces as `ClientError::Server`.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use crate::batch::{Batch, BatchExecutor};
use crate::cmd::{Cmd, ToArg};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::pubsub::Subscription;
use crate::reply::{FromReply, Reply};
use crate::script::{expect_success, Script, ScriptInvocation, ScriptResult};
use crate::transaction::{Plan, ReadPhase, RetryPolicy, TransactionCoordinator, TxOutcome};

/// TTL state returned by the server, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Synchronous client with connection pooling.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct KVClient {
    pool: ConnectionPool,
}

impl KVClient {
    /// Creates a client with default configuration.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        Self::with_config(ClientConfig::with_addr(addr))
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let pool = ConnectionPool::new(config)?;
        Ok(KVClient { pool })
    }

    pub fn config(&self) -> &ClientConfig {
        self.pool.config()
    }

    /// Borrows a pooled connection for caller-driven work such as a manual
    /// `TransactionSession`. It returns to the pool on drop.
    pub fn dedicated(&self) -> ClientResult<PooledConnection> {
        self.pool.acquire()
    }

    /// Runs one command and converts its reply.
    pub fn execute<T: FromReply>(&self, cmd: &Cmd) -> ClientResult<T> {
        let mut conn = self.pool.acquire()?;
        T::from_reply(conn.execute(cmd)?)
    }

    /// Sends every command of `batch` in one round trip.
    ///
    /// Replies line up with the batch; error replies stay in their slot.
    pub fn pipeline(&self, batch: Batch) -> ClientResult<Vec<Reply>> {
        let mut conn = self.pool.acquire()?;
        conn.submit(batch)
    }

    /// Runs an optimistic transaction over `keys` with the configured retry
    /// policy. See `TransactionCoordinator::run`.
    pub fn transaction<K, A, F>(&self, keys: &[K], critical: F) -> ClientResult<TxOutcome<A>>
    where
        K: ToArg,
        F: FnMut(&mut ReadPhase<'_, '_>) -> ClientResult<Plan<A>>,
    {
        self.transaction_with(self.config().retry_policy(), keys, critical)
    }

    pub fn transaction_with<K, A, F>(
        &self,
        policy: RetryPolicy,
        keys: &[K],
        critical: F,
    ) -> ClientResult<TxOutcome<A>>
    where
        K: ToArg,
        F: FnMut(&mut ReadPhase<'_, '_>) -> ClientResult<Plan<A>>,
    {
        let mut conn = self.pool.acquire()?;
        TransactionCoordinator::new(policy).run(&mut conn, keys, critical)
    }

    /// Runs a script with `EVAL`.
    pub fn eval(&self, invocation: &ScriptInvocation) -> ClientResult<ScriptResult> {
        let mut conn = self.pool.acquire()?;
        invocation.invoke(&mut conn)
    }

    /// Runs a cached script with `EVALSHA`, loading it when needed.
    pub fn run_script<K: ToArg, A: ToArg>(
        &self,
        script: &Script,
        keys: &[K],
        args: &[A],
    ) -> ClientResult<ScriptResult> {
        let mut conn = self.pool.acquire()?;
        script.invoke(&mut conn, keys, args)
    }

    /// Like `run_script`, but a script failure becomes `ClientError::Server`.
    pub fn script_value<T: FromReply, K: ToArg, A: ToArg>(
        &self,
        script: &Script,
        keys: &[K],
        args: &[A],
    ) -> ClientResult<T> {
        expect_success(self.run_script(script, keys, args)?)
    }

    /// Publishes a payload. Returns the number of receiving subscribers.
    pub fn publish<C: ToArg, P: ToArg>(&self, channel: C, payload: P) -> ClientResult<i64> {
        self.execute(&Cmd::publish(channel, payload))
    }

    /// Subscribes to channels on a new dedicated connection.
    pub fn subscribe(&self, channels: &[&str]) -> ClientResult<Subscription> {
        Subscription::open(self.config(), channels, &[])
    }

    /// Subscribes to glob patterns on a new dedicated connection.
    pub fn psubscribe(&self, patterns: &[&str]) -> ClientResult<Subscription> {
        Subscription::open(self.config(), &[], patterns)
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get<K: ToArg>(&self, key: K) -> ClientResult<Option<Bytes>> {
        self.execute(&Cmd::get(key))
    }

    /// Fetches a value as UTF-8 text.
    pub fn get_string<K: ToArg>(&self, key: K) -> ClientResult<Option<String>> {
        self.execute(&Cmd::get(key))
    }

    /// Sets a value for a key without expiration.
    pub fn set<K: ToArg, V: ToArg>(&self, key: K, value: V) -> ClientResult<()> {
        self.execute_ok(&Cmd::set(key, value))
    }

    /// Sets a value and attaches an expiration (whole seconds).
    pub fn set_with_ttl<K: ToArg, V: ToArg>(&self, key: K, value: V, ttl: Duration) -> ClientResult<()> {
        self.execute_ok(&Cmd::set_ex(key, value, ttl.as_secs()))
    }

    pub fn incr<K: ToArg>(&self, key: K) -> ClientResult<i64> {
        self.execute(&Cmd::incr(key))
    }

    pub fn incr_by<K: ToArg>(&self, key: K, delta: i64) -> ClientResult<i64> {
        self.execute(&Cmd::incr_by(key, delta))
    }

    pub fn decr_by<K: ToArg>(&self, key: K, delta: i64) -> ClientResult<i64> {
        self.execute(&Cmd::decr_by(key, delta))
    }

    pub fn mset<K: ToArg, V: ToArg>(&self, pairs: &[(K, V)]) -> ClientResult<()> {
        self.execute_ok(&Cmd::mset(pairs))
    }

    pub fn mget<K: ToArg>(&self, keys: &[K]) -> ClientResult<Vec<Option<Bytes>>> {
        self.execute(&Cmd::mget(keys))
    }

    /// Deletes keys. Returns how many existed.
    pub fn delete<K: ToArg>(&self, keys: &[K]) -> ClientResult<i64> {
        self.execute(&Cmd::del(keys))
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub fn expire<K: ToArg>(&self, key: K, ttl: Duration) -> ClientResult<bool> {
        self.execute(&Cmd::expire(key, ttl.as_secs()))
    }

    /// Returns TTL status for a key.
    pub fn ttl<K: ToArg>(&self, key: K) -> ClientResult<ClientTtl> {
        match self.execute::<i64>(&Cmd::ttl(key))? {
            -2 => Ok(ClientTtl::Missing),
            -1 => Ok(ClientTtl::NoExpiry),
            value if value >= 0 => Ok(ClientTtl::ExpiresIn(Duration::from_secs(value as u64))),
            _ => Err(ClientError::UnexpectedResponse {
                expected: "ttl seconds",
                found: "integer",
            }),
        }
    }

    /// Sets hash fields. Returns how many fields were new.
    pub fn hset<K: ToArg, F: ToArg, V: ToArg>(&self, key: K, fields: &[(F, V)]) -> ClientResult<i64> {
        self.execute(&Cmd::hset(key, fields))
    }

    pub fn hget<K: ToArg, F: ToArg>(&self, key: K, field: F) -> ClientResult<Option<String>> {
        self.execute(&Cmd::hget(key, field))
    }

    pub fn hgetall<K: ToArg>(&self, key: K) -> ClientResult<HashMap<String, String>> {
        self.execute(&Cmd::hgetall(key))
    }

    pub fn hincr_by<K: ToArg, F: ToArg>(&self, key: K, field: F, delta: i64) -> ClientResult<i64> {
        self.execute(&Cmd::hincr_by(key, field, delta))
    }

    /// Pushes values to the head. Returns the new list length.
    pub fn lpush<K: ToArg, V: ToArg>(&self, key: K, values: &[V]) -> ClientResult<i64> {
        self.execute(&Cmd::lpush(key, values))
    }

    /// Pushes values to the tail. Returns the new list length.
    pub fn rpush<K: ToArg, V: ToArg>(&self, key: K, values: &[V]) -> ClientResult<i64> {
        self.execute(&Cmd::rpush(key, values))
    }

    pub fn lrange<K: ToArg>(&self, key: K, start: i64, stop: i64) -> ClientResult<Vec<String>> {
        self.execute(&Cmd::lrange(key, start, stop))
    }

    pub fn llen<K: ToArg>(&self, key: K) -> ClientResult<i64> {
        self.execute(&Cmd::llen(key))
    }

    pub fn lpop<K: ToArg>(&self, key: K) -> ClientResult<Option<String>> {
        self.execute(&Cmd::lpop(key))
    }

    pub fn rpop<K: ToArg>(&self, key: K) -> ClientResult<Option<String>> {
        self.execute(&Cmd::rpop(key))
    }

    /// Adds set members. Returns how many were new.
    pub fn sadd<K: ToArg, M: ToArg>(&self, key: K, members: &[M]) -> ClientResult<i64> {
        self.execute(&Cmd::sadd(key, members))
    }

    pub fn smembers<K: ToArg>(&self, key: K) -> ClientResult<Vec<String>> {
        self.execute(&Cmd::smembers(key))
    }

    pub fn sismember<K: ToArg, M: ToArg>(&self, key: K, member: M) -> ClientResult<bool> {
        self.execute(&Cmd::sismember(key, member))
    }

    pub fn scard<K: ToArg>(&self, key: K) -> ClientResult<i64> {
        self.execute(&Cmd::scard(key))
    }

    /// Adds scored members. Returns how many were new.
    pub fn zadd<K: ToArg, M: ToArg>(&self, key: K, members: &[(M, f64)]) -> ClientResult<i64> {
        self.execute(&Cmd::zadd(key, members))
    }

    pub fn zrange<K: ToArg>(&self, key: K, start: i64, stop: i64) -> ClientResult<Vec<String>> {
        self.execute(&Cmd::zrange(key, start, stop, false))
    }

    /// Ascending rank range with scores.
    pub fn zrange_withscores<K: ToArg>(
        &self,
        key: K,
        start: i64,
        stop: i64,
    ) -> ClientResult<Vec<(String, f64)>> {
        self.execute::<Reply>(&Cmd::zrange(key, start, stop, true))?
            .into_pairs()
    }

    /// Descending rank range with scores.
    pub fn zrevrange_withscores<K: ToArg>(
        &self,
        key: K,
        start: i64,
        stop: i64,
    ) -> ClientResult<Vec<(String, f64)>> {
        self.execute::<Reply>(&Cmd::zrevrange(key, start, stop, true))?
            .into_pairs()
    }

    pub fn zscore<K: ToArg, M: ToArg>(&self, key: K, member: M) -> ClientResult<Option<f64>> {
        self.execute(&Cmd::zscore(key, member))
    }

    pub fn zrank<K: ToArg, M: ToArg>(&self, key: K, member: M) -> ClientResult<Option<i64>> {
        self.execute(&Cmd::zrank(key, member))
    }

    /// Pings the server. Returns the status text (normally `PONG`).
    pub fn ping(&self) -> ClientResult<String> {
        self.execute(&Cmd::ping())
    }

    /// Fetches server INFO output.
    pub fn info(&self) -> ClientResult<String> {
        self.execute(&Cmd::info())
    }

    /// Removes every key in the current database.
    pub fn flushdb(&self) -> ClientResult<()> {
        self.execute_ok(&Cmd::flushdb())
    }

    fn execute_ok(&self, cmd: &Cmd) -> ClientResult<()> {
        match self.execute::<Reply>(cmd)? {
            Reply::Status(_) => Ok(()),
            Reply::Error(err) => Err(ClientError::Server(err)),
            other => Err(ClientError::UnexpectedResponse {
                expected: "status",
                found: other.kind_name(),
            }),
        }
    }
}
