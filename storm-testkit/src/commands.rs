//! Data commands that only touch the keyspace.
//!
//! Shared by plain requests, `EXEC` and script `call`s, so each of them runs
//! against the same locked `Keyspace`.

use std::time::Duration;

use crate::keyspace::{parse_f64, parse_i64, Keyspace, StoreError};
use crate::protocol::Value;

const DATA_COMMANDS: &[&str] = &[
    "GET", "SET", "MSET", "MGET", "INCR", "INCRBY", "DECR", "DECRBY", "DEL", "EXISTS", "EXPIRE",
    "TTL", "HSET", "HGET", "HGETALL", "HINCRBY", "LPUSH", "RPUSH", "LRANGE", "LLEN", "LPOP",
    "RPOP", "SADD", "SMEMBERS", "SISMEMBER", "SCARD", "ZADD", "ZRANGE", "ZREVRANGE", "ZSCORE",
    "ZRANK", "FLUSHDB", "DBSIZE",
];

/// Returns true when `name` (upper case) is handled by `apply`.
pub fn is_data_command(name: &str) -> bool {
    DATA_COMMANDS.contains(&name)
}

/// Runs one data command against `store`.
pub fn apply(store: &mut Keyspace, args: &[Vec<u8>]) -> Value {
    let name = match args.first() {
        Some(name) => String::from_utf8_lossy(name).to_ascii_uppercase(),
        None => return Value::error("ERR empty command"),
    };
    let result = match name.as_str() {
        "GET" => arity(&name, args, 2).and_then(|()| Ok(optional_bulk(store.get(&args[1])?))),
        "SET" => handle_set(store, args),
        "MSET" => handle_mset(store, args),
        "MGET" => handle_mget(store, args),
        "INCR" => arity(&name, args, 2).and_then(|()| Ok(Value::Integer(store.incr_by(&args[1], 1)?))),
        "DECR" => arity(&name, args, 2).and_then(|()| Ok(Value::Integer(store.incr_by(&args[1], -1)?))),
        "INCRBY" => handle_incr_by(store, args, &name, 1),
        "DECRBY" => handle_incr_by(store, args, &name, -1),
        "DEL" => min_arity(&name, args, 2).map(|()| {
            Value::Integer(args[1..].iter().filter(|key| store.del(key)).count() as i64)
        }),
        "EXISTS" => min_arity(&name, args, 2).map(|()| {
            Value::Integer(args[1..].iter().filter(|key| store.ttl(key) != -2).count() as i64)
        }),
        "EXPIRE" => handle_expire(store, args),
        "TTL" => arity(&name, args, 2).map(|()| Value::Integer(store.ttl(&args[1]))),
        "HSET" => handle_hset(store, args),
        "HGET" => arity(&name, args, 3)
            .and_then(|()| Ok(optional_bulk(store.hget(&args[1], &args[2])?))),
        "HGETALL" => arity(&name, args, 2).and_then(|()| {
            let mut flat = Vec::new();
            for (field, value) in store.hgetall(&args[1])? {
                flat.push(Value::Bulk(field));
                flat.push(Value::Bulk(value));
            }
            Ok(Value::Array(flat))
        }),
        "HINCRBY" => arity(&name, args, 4).and_then(|()| {
            let delta = int_arg(&args[3])?;
            Ok(Value::Integer(store.hincr_by(&args[1], &args[2], delta)?))
        }),
        "LPUSH" | "RPUSH" => min_arity(&name, args, 3).and_then(|()| {
            let len = store.push(&args[1], &args[2..], name == "LPUSH")?;
            Ok(Value::Integer(len as i64))
        }),
        "LRANGE" => arity(&name, args, 4).and_then(|()| {
            let items = store.lrange(&args[1], int_arg(&args[2])?, int_arg(&args[3])?)?;
            Ok(Value::Array(items.into_iter().map(Value::Bulk).collect()))
        }),
        "LLEN" => arity(&name, args, 2).and_then(|()| Ok(Value::Integer(store.llen(&args[1])? as i64))),
        "LPOP" | "RPOP" => arity(&name, args, 2)
            .and_then(|()| Ok(optional_bulk(store.pop(&args[1], name == "LPOP")?))),
        "SADD" => min_arity(&name, args, 3)
            .and_then(|()| Ok(Value::Integer(store.sadd(&args[1], &args[2..])? as i64))),
        "SMEMBERS" => arity(&name, args, 2).and_then(|()| {
            Ok(Value::Array(store.smembers(&args[1])?.into_iter().map(Value::Bulk).collect()))
        }),
        "SISMEMBER" => arity(&name, args, 3)
            .and_then(|()| Ok(Value::Integer(i64::from(store.sismember(&args[1], &args[2])?)))),
        "SCARD" => arity(&name, args, 2).and_then(|()| Ok(Value::Integer(store.scard(&args[1])? as i64))),
        "ZADD" => handle_zadd(store, args),
        "ZRANGE" | "ZREVRANGE" => handle_zrange(store, args, &name),
        "ZSCORE" => arity(&name, args, 3).and_then(|()| {
            Ok(match store.zscore(&args[1], &args[2])? {
                Some(score) => Value::bulk(score.to_string()),
                None => Value::Nil,
            })
        }),
        "ZRANK" => arity(&name, args, 3).and_then(|()| {
            Ok(match store.zrank(&args[1], &args[2])? {
                Some(rank) => Value::Integer(rank as i64),
                None => Value::Nil,
            })
        }),
        "FLUSHDB" => {
            store.flush();
            Ok(Value::ok())
        }
        "DBSIZE" => Ok(Value::Integer(store.len() as i64)),
        _ => Err(Value::error(format!(
            "ERR unknown command '{}'",
            String::from_utf8_lossy(&args[0])
        ))),
    };

    result.unwrap_or_else(|err| err)
}

type CommandResult = Result<Value, Value>;

impl From<StoreError> for Value {
    fn from(err: StoreError) -> Self {
        Value::error(err.message())
    }
}

fn handle_set(store: &mut Keyspace, args: &[Vec<u8>]) -> CommandResult {
    if args.len() == 3 {
        store.set(&args[1], args[2].clone(), None);
        return Ok(Value::ok());
    }
    if args.len() == 5 && args[3].eq_ignore_ascii_case(b"EX") {
        let seconds = int_arg(&args[4])?;
        if seconds <= 0 {
            return Err(Value::error("ERR invalid expire time in 'set' command"));
        }
        store.set(&args[1], args[2].clone(), Some(Duration::from_secs(seconds as u64)));
        return Ok(Value::ok());
    }
    if args.len() < 3 {
        return Err(wrong_arity("SET"));
    }
    Err(Value::error("ERR syntax error"))
}

fn handle_mset(store: &mut Keyspace, args: &[Vec<u8>]) -> CommandResult {
    if args.len() < 3 || args.len() % 2 == 0 {
        return Err(wrong_arity("MSET"));
    }
    for pair in args[1..].chunks(2) {
        store.set(&pair[0], pair[1].clone(), None);
    }
    Ok(Value::ok())
}

fn handle_mget(store: &mut Keyspace, args: &[Vec<u8>]) -> CommandResult {
    min_arity("MGET", args, 2)?;
    let values = args[1..]
        .iter()
        // A non-string key reads as nil for MGET.
        .map(|key| optional_bulk(store.get(key).unwrap_or(None)))
        .collect();
    Ok(Value::Array(values))
}

fn handle_incr_by(store: &mut Keyspace, args: &[Vec<u8>], name: &str, sign: i64) -> CommandResult {
    arity(name, args, 3)?;
    let delta = int_arg(&args[2])?
        .checked_mul(sign)
        .ok_or_else(|| Value::from(StoreError::Overflow))?;
    Ok(Value::Integer(store.incr_by(&args[1], delta)?))
}

fn handle_expire(store: &mut Keyspace, args: &[Vec<u8>]) -> CommandResult {
    arity("EXPIRE", args, 3)?;
    let seconds = int_arg(&args[2])?;
    if seconds <= 0 {
        return Ok(Value::Integer(i64::from(store.del(&args[1]))));
    }
    let applied = store.expire(&args[1], Duration::from_secs(seconds as u64));
    Ok(Value::Integer(i64::from(applied)))
}

fn handle_hset(store: &mut Keyspace, args: &[Vec<u8>]) -> CommandResult {
    if args.len() < 4 || args.len() % 2 != 0 {
        return Err(wrong_arity("HSET"));
    }
    let mut added = 0;
    for pair in args[2..].chunks(2) {
        if store.hset(&args[1], &pair[0], &pair[1])? {
            added += 1;
        }
    }
    Ok(Value::Integer(added))
}

fn handle_zadd(store: &mut Keyspace, args: &[Vec<u8>]) -> CommandResult {
    if args.len() < 4 || args.len() % 2 != 0 {
        return Err(wrong_arity("ZADD"));
    }
    let mut members = Vec::with_capacity((args.len() - 2) / 2);
    for pair in args[2..].chunks(2) {
        let score = parse_f64(&pair[0]).ok_or_else(|| Value::from(StoreError::NotFloat))?;
        members.push((score, pair[1].clone()));
    }
    Ok(Value::Integer(store.zadd(&args[1], &members)? as i64))
}

fn handle_zrange(store: &mut Keyspace, args: &[Vec<u8>], name: &str) -> CommandResult {
    let with_scores = match args.len() {
        4 => false,
        5 if args[4].eq_ignore_ascii_case(b"WITHSCORES") => true,
        5 => return Err(Value::error("ERR syntax error")),
        _ => return Err(wrong_arity(name)),
    };
    let start = int_arg(&args[2])?;
    let stop = int_arg(&args[3])?;
    let ranked = store.zrange(&args[1], start, stop, name == "ZREVRANGE")?;

    let mut flat = Vec::with_capacity(ranked.len() * if with_scores { 2 } else { 1 });
    for (member, score) in ranked {
        flat.push(Value::Bulk(member));
        if with_scores {
            flat.push(Value::bulk(score.to_string()));
        }
    }
    Ok(Value::Array(flat))
}

fn optional_bulk(value: Option<Vec<u8>>) -> Value {
    value.map(Value::Bulk).unwrap_or(Value::Nil)
}

fn int_arg(raw: &[u8]) -> Result<i64, Value> {
    parse_i64(raw).ok_or_else(|| Value::from(StoreError::NotInteger))
}

fn arity(name: &str, args: &[Vec<u8>], expected: usize) -> Result<(), Value> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(wrong_arity(name))
    }
}

fn min_arity(name: &str, args: &[Vec<u8>], minimum: usize) -> Result<(), Value> {
    if args.len() >= minimum {
        Ok(())
    } else {
        Err(wrong_arity(name))
    }
}

pub(crate) fn wrong_arity(name: &str) -> Value {
    Value::error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(store: &mut Keyspace, parts: &[&str]) -> Value {
        let args: Vec<Vec<u8>> = parts.iter().map(|part| part.as_bytes().to_vec()).collect();
        apply(store, &args)
    }

    #[test]
    fn string_commands() {
        let mut store = Keyspace::new();
        assert_eq!(run(&mut store, &["SET", "k", "v"]), Value::ok());
        assert_eq!(run(&mut store, &["GET", "k"]), Value::bulk("v"));
        assert_eq!(run(&mut store, &["GET", "nope"]), Value::Nil);
        assert_eq!(run(&mut store, &["INCRBY", "n", "5"]), Value::Integer(5));
        assert_eq!(run(&mut store, &["DECRBY", "n", "2"]), Value::Integer(3));
        assert_eq!(run(&mut store, &["DEL", "k", "n", "zz"]), Value::Integer(2));
    }

    #[test]
    fn wrong_type_and_arity_errors() {
        let mut store = Keyspace::new();
        run(&mut store, &["LPUSH", "l", "a"]);
        match run(&mut store, &["GET", "l"]) {
            Value::Error(message) => assert!(message.starts_with("WRONGTYPE")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            run(&mut store, &["GET"]),
            Value::error("ERR wrong number of arguments for 'get' command")
        );
        assert!(run(&mut store, &["NOPE"]).is_error());
    }

    #[test]
    fn zrange_with_scores_is_flat() {
        let mut store = Keyspace::new();
        run(&mut store, &["ZADD", "z", "1", "a", "2.5", "b"]);
        assert_eq!(
            run(&mut store, &["ZREVRANGE", "z", "0", "-1", "WITHSCORES"]),
            Value::Array(vec![
                Value::bulk("b"),
                Value::bulk("2.5"),
                Value::bulk("a"),
                Value::bulk("1"),
            ])
        );
    }

    #[test]
    fn hash_commands() {
        let mut store = Keyspace::new();
        assert_eq!(run(&mut store, &["HSET", "h", "a", "1", "b", "2"]), Value::Integer(2));
        assert_eq!(run(&mut store, &["HINCRBY", "h", "a", "4"]), Value::Integer(5));
        assert_eq!(
            run(&mut store, &["HGETALL", "h"]),
            Value::Array(vec![
                Value::bulk("a"),
                Value::bulk("5"),
                Value::bulk("b"),
                Value::bulk("2"),
            ])
        );
    }
}
