//! # Commands
//!
//! Purpose: Represent one store operation as a name plus ordered, opaque
//! arguments, and provide constructors for the command surface the client
//! exposes.
//!
//! ## Design Principles
//! 1. **Immutable Once Built**: The builder consumes `self`; a finished `Cmd`
//!    has no mutators, so a staged or batched command cannot change later.
//! 2. **Cheap Clones**: Arguments are `Bytes`, so retries re-send without
//!    copying payloads.
//! 3. **Binary-Safe**: Arguments are raw bytes; text is only a convenience.

use std::fmt;

use bytes::Bytes;

/// Conversion into a single wire argument.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<const N: usize> ToArg for [u8; N] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

macro_rules! int_to_arg {
    ($($ty:ty),*) => {
        $(
            impl ToArg for $ty {
                fn to_arg(&self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

int_to_arg!(i32, i64, u32, u64, usize);

impl ToArg for f64 {
    fn to_arg(&self) -> Bytes {
        if self.is_infinite() {
            let text = if *self > 0.0 { "+inf" } else { "-inf" };
            return Bytes::from_static(text.as_bytes());
        }
        Bytes::from(self.to_string())
    }
}

/// A single command: operation name plus ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    name: String,
    args: Vec<Bytes>,
}

impl Cmd {
    /// Starts a command. The name is sent exactly as given.
    pub fn new(name: &str) -> Self {
        Cmd {
            name: name.to_string(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg<A: ToArg>(mut self, arg: A) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    /// Appends every argument from the iterator, in order.
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.args.extend(args.into_iter().map(|arg| arg.to_arg()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Bytes] {
        &self.args
    }

    /// Number of wire parts, name included.
    pub fn part_count(&self) -> usize {
        self.args.len() + 1
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.args.is_empty() {
            write!(f, " <{} args>", self.args.len())?;
        }
        Ok(())
    }
}

// Strings and keys.
impl Cmd {
    pub fn get<K: ToArg>(key: K) -> Self {
        Cmd::new("GET").arg(key)
    }

    pub fn set<K: ToArg, V: ToArg>(key: K, value: V) -> Self {
        Cmd::new("SET").arg(key).arg(value)
    }

    pub fn set_ex<K: ToArg, V: ToArg>(key: K, value: V, seconds: u64) -> Self {
        Cmd::new("SET").arg(key).arg(value).arg("EX").arg(seconds)
    }

    pub fn incr<K: ToArg>(key: K) -> Self {
        Cmd::new("INCR").arg(key)
    }

    pub fn incr_by<K: ToArg>(key: K, delta: i64) -> Self {
        Cmd::new("INCRBY").arg(key).arg(delta)
    }

    pub fn decr_by<K: ToArg>(key: K, delta: i64) -> Self {
        Cmd::new("DECRBY").arg(key).arg(delta)
    }

    pub fn mset<K: ToArg, V: ToArg>(pairs: &[(K, V)]) -> Self {
        pairs
            .iter()
            .fold(Cmd::new("MSET"), |cmd, (key, value)| cmd.arg(key).arg(value))
    }

    pub fn mget<K: ToArg>(keys: &[K]) -> Self {
        Cmd::new("MGET").args(keys)
    }

    pub fn del<K: ToArg>(keys: &[K]) -> Self {
        Cmd::new("DEL").args(keys)
    }

    pub fn expire<K: ToArg>(key: K, seconds: u64) -> Self {
        Cmd::new("EXPIRE").arg(key).arg(seconds)
    }

    pub fn ttl<K: ToArg>(key: K) -> Self {
        Cmd::new("TTL").arg(key)
    }
}

// Hashes.
impl Cmd {
    pub fn hset<K: ToArg, F: ToArg, V: ToArg>(key: K, fields: &[(F, V)]) -> Self {
        fields
            .iter()
            .fold(Cmd::new("HSET").arg(key), |cmd, (field, value)| {
                cmd.arg(field).arg(value)
            })
    }

    pub fn hget<K: ToArg, F: ToArg>(key: K, field: F) -> Self {
        Cmd::new("HGET").arg(key).arg(field)
    }

    pub fn hgetall<K: ToArg>(key: K) -> Self {
        Cmd::new("HGETALL").arg(key)
    }

    pub fn hincr_by<K: ToArg, F: ToArg>(key: K, field: F, delta: i64) -> Self {
        Cmd::new("HINCRBY").arg(key).arg(field).arg(delta)
    }
}

// Lists.
impl Cmd {
    pub fn lpush<K: ToArg, V: ToArg>(key: K, values: &[V]) -> Self {
        Cmd::new("LPUSH").arg(key).args(values)
    }

    pub fn rpush<K: ToArg, V: ToArg>(key: K, values: &[V]) -> Self {
        Cmd::new("RPUSH").arg(key).args(values)
    }

    pub fn lrange<K: ToArg>(key: K, start: i64, stop: i64) -> Self {
        Cmd::new("LRANGE").arg(key).arg(start).arg(stop)
    }

    pub fn llen<K: ToArg>(key: K) -> Self {
        Cmd::new("LLEN").arg(key)
    }

    pub fn lpop<K: ToArg>(key: K) -> Self {
        Cmd::new("LPOP").arg(key)
    }

    pub fn rpop<K: ToArg>(key: K) -> Self {
        Cmd::new("RPOP").arg(key)
    }
}

// Sets.
impl Cmd {
    pub fn sadd<K: ToArg, M: ToArg>(key: K, members: &[M]) -> Self {
        Cmd::new("SADD").arg(key).args(members)
    }

    pub fn smembers<K: ToArg>(key: K) -> Self {
        Cmd::new("SMEMBERS").arg(key)
    }

    pub fn sismember<K: ToArg, M: ToArg>(key: K, member: M) -> Self {
        Cmd::new("SISMEMBER").arg(key).arg(member)
    }

    pub fn scard<K: ToArg>(key: K) -> Self {
        Cmd::new("SCARD").arg(key)
    }
}

// Sorted sets.
impl Cmd {
    pub fn zadd<K: ToArg, M: ToArg>(key: K, members: &[(M, f64)]) -> Self {
        members
            .iter()
            .fold(Cmd::new("ZADD").arg(key), |cmd, (member, score)| {
                cmd.arg(*score).arg(member)
            })
    }

    pub fn zrange<K: ToArg>(key: K, start: i64, stop: i64, with_scores: bool) -> Self {
        let cmd = Cmd::new("ZRANGE").arg(key).arg(start).arg(stop);
        if with_scores {
            cmd.arg("WITHSCORES")
        } else {
            cmd
        }
    }

    pub fn zrevrange<K: ToArg>(key: K, start: i64, stop: i64, with_scores: bool) -> Self {
        let cmd = Cmd::new("ZREVRANGE").arg(key).arg(start).arg(stop);
        if with_scores {
            cmd.arg("WITHSCORES")
        } else {
            cmd
        }
    }

    pub fn zscore<K: ToArg, M: ToArg>(key: K, member: M) -> Self {
        Cmd::new("ZSCORE").arg(key).arg(member)
    }

    pub fn zrank<K: ToArg, M: ToArg>(key: K, member: M) -> Self {
        Cmd::new("ZRANK").arg(key).arg(member)
    }
}

// Transactions, scripting, pub/sub and server.
impl Cmd {
    pub fn watch<K: ToArg>(keys: &[K]) -> Self {
        Cmd::new("WATCH").args(keys)
    }

    pub fn unwatch() -> Self {
        Cmd::new("UNWATCH")
    }

    pub fn multi() -> Self {
        Cmd::new("MULTI")
    }

    pub fn exec() -> Self {
        Cmd::new("EXEC")
    }

    pub fn discard() -> Self {
        Cmd::new("DISCARD")
    }

    pub fn eval<K: ToArg, A: ToArg>(source: &str, keys: &[K], args: &[A]) -> Self {
        Cmd::new("EVAL")
            .arg(source)
            .arg(keys.len())
            .args(keys)
            .args(args)
    }

    pub fn evalsha<K: ToArg, A: ToArg>(sha: &str, keys: &[K], args: &[A]) -> Self {
        Cmd::new("EVALSHA")
            .arg(sha)
            .arg(keys.len())
            .args(keys)
            .args(args)
    }

    pub fn script_load(source: &str) -> Self {
        Cmd::new("SCRIPT").arg("LOAD").arg(source)
    }

    pub fn publish<C: ToArg, P: ToArg>(channel: C, payload: P) -> Self {
        Cmd::new("PUBLISH").arg(channel).arg(payload)
    }

    pub fn subscribe<C: ToArg>(channels: &[C]) -> Self {
        Cmd::new("SUBSCRIBE").args(channels)
    }

    pub fn unsubscribe<C: ToArg>(channels: &[C]) -> Self {
        Cmd::new("UNSUBSCRIBE").args(channels)
    }

    pub fn psubscribe<P: ToArg>(patterns: &[P]) -> Self {
        Cmd::new("PSUBSCRIBE").args(patterns)
    }

    pub fn punsubscribe<P: ToArg>(patterns: &[P]) -> Self {
        Cmd::new("PUNSUBSCRIBE").args(patterns)
    }

    pub fn ping() -> Self {
        Cmd::new("PING")
    }

    pub fn info() -> Self {
        Cmd::new("INFO")
    }

    pub fn flushdb() -> Self {
        Cmd::new("FLUSHDB")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(cmd: &Cmd) -> Vec<String> {
        cmd.arguments()
            .iter()
            .map(|arg| String::from_utf8(arg.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn builder_keeps_argument_order() {
        let cmd = Cmd::new("SET").arg("key").arg(b"value").arg(42i64);
        assert_eq!(cmd.name(), "SET");
        assert_eq!(texts(&cmd), vec!["key", "value", "42"]);
        assert_eq!(cmd.part_count(), 4);
    }

    #[test]
    fn eval_carries_key_count() {
        let cmd = Cmd::eval("return 1", &["limited_counter"], &[10i64]);
        assert_eq!(texts(&cmd), vec!["return 1", "1", "limited_counter", "10"]);
    }

    #[test]
    fn zadd_puts_score_before_member() {
        let cmd = Cmd::zadd("leaderboard", &[("player1", 100.0), ("player2", 200.5)]);
        assert_eq!(texts(&cmd), vec!["leaderboard", "100", "player1", "200.5", "player2"]);
    }

    #[test]
    fn hset_flattens_fields() {
        let cmd = Cmd::hset("user:1", &[("name", "John Doe"), ("age", "30")]);
        assert_eq!(texts(&cmd), vec!["user:1", "name", "John Doe", "age", "30"]);
    }

    #[test]
    fn display_hides_payloads() {
        let cmd = Cmd::set("secret", "value");
        assert_eq!(cmd.to_string(), "SET <2 args>");
        assert_eq!(Cmd::multi().to_string(), "MULTI");
    }
}
