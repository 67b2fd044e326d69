//! # CacheStorm Walkthrough
//!
//! Purpose: Exercise the client end to end against a running store, one
//! data type at a time, and show the three coordination patterns in use:
//! a pipelined batch, a funds transfer under WATCH, and a subscriber that
//! stops on a sentinel message.
//!
//! The building blocks (`transfer`, `RateLimiter`, `collect_until_stop`) are
//! public so the scenarios can be driven on their own.

use std::io::Write;
use std::thread;

use anyhow::{anyhow, Context, Result};
use storm_client::{
    Batch, ClientResult, ClientTtl, Cmd, KVClient, ListenControl, Plan, Script, ScriptFailure,
    Subscription, TxOutcome,
};
use tracing::{debug, info};

/// Channel the walkthrough publishes on.
pub const NOTIFICATIONS: &str = "notifications";

/// Payload that makes a subscriber stop listening.
pub const STOP: &str = "STOP";

/// Counter that refuses to pass `ARGV[1]`.
pub const LIMITED_COUNTER_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
    return redis.error_reply('LIMIT_EXCEEDED')
end
return redis.call('INCR', KEYS[1])
"#;

/// Result of a transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { attempts: u32 },
    InsufficientFunds { balance: i64 },
}

/// Moves `amount` from `from` to `to` if `from` holds enough.
///
/// Both balances are watched; a concurrent write to either one reruns the
/// check with fresh values. A missing key counts as a zero balance.
pub fn transfer(client: &KVClient, from: &str, to: &str, amount: i64) -> ClientResult<TransferOutcome> {
    let outcome = client.transaction(&[from, to], |tx| {
        let balance = tx.get::<Option<i64>, _>(from)?.unwrap_or(0);
        if balance < amount {
            return Ok(Plan::Abort(balance));
        }
        Ok(Plan::Commit(vec![
            Cmd::decr_by(from, amount),
            Cmd::incr_by(to, amount),
        ]))
    })?;

    Ok(match outcome {
        TxOutcome::Committed { attempts, .. } => TransferOutcome::Completed { attempts },
        TxOutcome::Aborted { reason, .. } => TransferOutcome::InsufficientFunds { balance: reason },
    })
}

/// Server-side counter with a hard ceiling.
pub struct RateLimiter {
    script: Script,
    limit: i64,
}

impl RateLimiter {
    pub fn new(limit: i64) -> Self {
        RateLimiter {
            script: Script::new(LIMITED_COUNTER_SCRIPT),
            limit,
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Increments `key` unless it already reached the limit.
    ///
    /// `Ok(Err(_))` carries the script's own refusal (`LIMIT_EXCEEDED`).
    pub fn try_acquire(&self, client: &KVClient, key: &str) -> ClientResult<Result<i64, ScriptFailure>> {
        client
            .run_script(&self.script, &[key], &[self.limit])?
            .typed::<i64>()
    }
}

/// One-shot form of [`RateLimiter::try_acquire`].
pub fn limited_increment(client: &KVClient, key: &str, limit: i64) -> ClientResult<Result<i64, ScriptFailure>> {
    RateLimiter::new(limit).try_acquire(client, key)
}

/// Drains `subscription` until a `STOP` payload arrives or the stream ends.
///
/// Returns every payload seen, the sentinel included.
pub fn collect_until_stop(subscription: &mut Subscription) -> ClientResult<Vec<String>> {
    let mut received = Vec::new();
    subscription.listen(|message| {
        let text = String::from_utf8_lossy(&message.payload).into_owned();
        let stop = text == STOP;
        debug!(channel = %message.channel, payload = %text, "message received");
        received.push(text);
        if stop {
            ListenControl::Stop
        } else {
            ListenControl::Continue
        }
    })?;
    Ok(received)
}

/// Runs every section in order, writing a human-readable report to `out`.
pub fn run_walkthrough<W: Write>(client: &KVClient, out: &mut W) -> Result<()> {
    strings(client, out)?;
    hashes(client, out)?;
    lists(client, out)?;
    sets(client, out)?;
    sorted_sets(client, out)?;
    scripting(client, out)?;
    pipeline(client, out)?;
    transaction(client, out)?;
    pubsub(client, out)?;

    section(out, "Cleanup")?;
    client.flushdb()?;
    writeln!(out, "Database flushed!")?;

    section(out, "Connection Info")?;
    let info = client.info()?;
    let version = info
        .lines()
        .find(|line| line.starts_with("redis_version:"))
        .unwrap_or("redis_version:unknown");
    writeln!(out, "Server {}", version)?;
    info!("walkthrough finished");
    Ok(())
}

fn section<W: Write>(out: &mut W, title: &str) -> Result<()> {
    writeln!(out, "\n=== {} ===", title)?;
    Ok(())
}

fn strings<W: Write>(client: &KVClient, out: &mut W) -> Result<()> {
    section(out, "String Operations")?;
    client.set("mykey", "Hello World")?;
    writeln!(out, "GET mykey: {:?}", client.get_string("mykey")?)?;

    client.set("counter", 0)?;
    client.incr("counter")?;
    let counter = client.incr("counter")?;
    writeln!(out, "Counter: {}", counter)?;

    client.mset(&[("key1", "value1"), ("key2", "value2"), ("key3", "value3")])?;
    let values: Vec<Option<String>> = client
        .mget(&["key1", "key2", "key3"])?
        .into_iter()
        .map(|value| value.map(|raw| String::from_utf8_lossy(&raw).into_owned()))
        .collect();
    writeln!(out, "MGET: {:?}", values)?;

    client.set_with_ttl("session", "data", std::time::Duration::from_secs(3600))?;
    match client.ttl("session")? {
        ClientTtl::ExpiresIn(left) => writeln!(out, "Session TTL: {} seconds", left.as_secs())?,
        other => writeln!(out, "Session TTL: {:?}", other)?,
    }
    Ok(())
}

fn hashes<W: Write>(client: &KVClient, out: &mut W) -> Result<()> {
    section(out, "Hash Operations")?;
    client.hset(
        "user:1",
        &[("name", "John Doe"), ("email", "john@example.com"), ("age", "30")],
    )?;
    writeln!(out, "User name: {:?}", client.hget("user:1", "name")?)?;

    let mut fields: Vec<(String, String)> = client.hgetall("user:1")?.into_iter().collect();
    fields.sort();
    writeln!(out, "All user data: {:?}", fields)?;

    let age = client.hincr_by("user:1", "age", 1)?;
    writeln!(out, "New age: {}", age)?;
    Ok(())
}

fn lists<W: Write>(client: &KVClient, out: &mut W) -> Result<()> {
    section(out, "List Operations")?;
    client.delete(&["mylist"])?;
    client.lpush("mylist", &["world"])?;
    client.lpush("mylist", &["hello"])?;
    client.rpush("mylist", &["!"])?;
    writeln!(out, "List contents: {:?}", client.lrange("mylist", 0, -1)?)?;
    writeln!(out, "List length: {}", client.llen("mylist")?)?;
    writeln!(out, "LPOP: {:?}", client.lpop("mylist")?)?;
    writeln!(out, "RPOP: {:?}", client.rpop("mylist")?)?;
    Ok(())
}

fn sets<W: Write>(client: &KVClient, out: &mut W) -> Result<()> {
    section(out, "Set Operations")?;
    client.sadd("myset", &["member1", "member2", "member3"])?;
    let mut members = client.smembers("myset")?;
    members.sort();
    writeln!(out, "Set members: {:?}", members)?;
    writeln!(out, "Is member1 in set? {}", client.sismember("myset", "member1")?)?;
    writeln!(out, "Set cardinality: {}", client.scard("myset")?)?;
    Ok(())
}

fn sorted_sets<W: Write>(client: &KVClient, out: &mut W) -> Result<()> {
    section(out, "Sorted Set Operations")?;
    client.zadd(
        "leaderboard",
        &[("player1", 100.0), ("player2", 200.0), ("player3", 150.0)],
    )?;
    writeln!(out, "Leaderboard: {:?}", client.zrange_withscores("leaderboard", 0, -1)?)?;
    writeln!(
        out,
        "Reverse leaderboard: {:?}",
        client.zrevrange_withscores("leaderboard", 0, -1)?
    )?;
    writeln!(out, "Player1 score: {:?}", client.zscore("leaderboard", "player1")?)?;
    writeln!(out, "Player1 rank: {:?}", client.zrank("leaderboard", "player1")?)?;
    Ok(())
}

fn scripting<W: Write>(client: &KVClient, out: &mut W) -> Result<()> {
    section(out, "Lua Scripting")?;
    client.set("limited_counter", 0)?;
    let limiter = RateLimiter::new(10);
    for round in 1..=12 {
        match limiter.try_acquire(client, "limited_counter")? {
            Ok(current) => writeln!(out, "Increment {}: {}", round, current)?,
            Err(failure) => writeln!(out, "Increment {}: Error - {}", round, failure.kind)?,
        }
    }
    Ok(())
}

fn pipeline<W: Write>(client: &KVClient, out: &mut W) -> Result<()> {
    section(out, "Pipeline (Batch Operations)")?;
    let mut batch = Batch::with_capacity(6);
    batch
        .add(Cmd::set("batch1", "value1"))
        .add(Cmd::set("batch2", "value2"))
        .add(Cmd::set("batch3", "value3"))
        .add(Cmd::get("batch1"))
        .add(Cmd::get("batch2"))
        .add(Cmd::get("batch3"));
    let replies = client.pipeline(batch)?;
    writeln!(out, "Pipeline results: {:?}", replies)?;
    Ok(())
}

fn transaction<W: Write>(client: &KVClient, out: &mut W) -> Result<()> {
    section(out, "Transaction")?;
    client.set("account:1", 100)?;
    client.set("account:2", 50)?;

    match transfer(client, "account:1", "account:2", 30)? {
        TransferOutcome::Completed { attempts } => {
            writeln!(out, "Transfer: successful after {} attempt(s)", attempts)?
        }
        TransferOutcome::InsufficientFunds { balance } => {
            writeln!(out, "Transfer: insufficient funds (balance {})", balance)?
        }
    }
    writeln!(out, "Account 1: {:?}", client.get_string("account:1")?)?;
    writeln!(out, "Account 2: {:?}", client.get_string("account:2")?)?;
    Ok(())
}

fn pubsub<W: Write>(client: &KVClient, out: &mut W) -> Result<()> {
    section(out, "Pub/Sub")?;
    // The subscription is confirmed before `subscribe` returns, so nothing
    // published below can be missed.
    let mut subscription = client.subscribe(&[NOTIFICATIONS])?;
    let subscriber = thread::Builder::new()
        .name("storm-demo-subscriber".to_string())
        .spawn(move || collect_until_stop(&mut subscription))
        .context("spawn subscriber")?;

    for payload in ["Hello subscribers!", "Another message", STOP] {
        client.publish(NOTIFICATIONS, payload)?;
    }

    let received = subscriber
        .join()
        .map_err(|_| anyhow!("subscriber thread panicked"))??;
    for payload in received {
        writeln!(out, "Received: {}", payload)?;
    }
    Ok(())
}
