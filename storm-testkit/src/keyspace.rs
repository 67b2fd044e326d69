//! # Keyspace
//!
//! Purpose: Hold typed values with lazy TTL expiry and a per-key version that
//! backs `WATCH`.
//!
//! ## Design Principles
//! 1. **Versions on Every Write**: Any mutation, delete or expiry stamps the
//!    key with a fresh version from a monotonic clock.
//! 2. **TTL Fast Path**: Expiration is checked on access, no background task.
//! 3. **Type Safety**: Operating on a key of another type is `WRONGTYPE`.
//!
//! ## Structure Overview
//!
//! ```text
//! Keyspace
//!   ├── entries: HashMap<key, Entry { data, expires_at }>
//!   ├── versions: HashMap<key, u64>
//!   └── clock: u64
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Failure of a keyspace operation, rendered as an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    WrongType,
    NotInteger,
    NotFloat,
    Overflow,
}

impl StoreError {
    pub fn message(self) -> &'static str {
        match self {
            StoreError::WrongType => {
                "WRONGTYPE Operation against a key holding the wrong kind of value"
            }
            StoreError::NotInteger => "ERR value is not an integer or out of range",
            StoreError::NotFloat => "ERR value is not a valid float",
            StoreError::Overflow => "ERR increment or decrement would overflow",
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
enum Data {
    Str(Vec<u8>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
    List(VecDeque<Vec<u8>>),
    Set(BTreeSet<Vec<u8>>),
    ZSet(HashMap<Vec<u8>, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(data: Data) -> Self {
        Entry {
            data,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

/// Typed in-memory keyspace.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<Vec<u8>, Entry>,
    versions: HashMap<Vec<u8>, u64>,
    clock: u64,
}

impl Keyspace {
    pub fn new() -> Self {
        Keyspace::default()
    }

    /// Number of live keys.
    pub fn len(&mut self) -> usize {
        self.purge_all_expired();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Version of `key`; changes whenever the key is written, deleted or
    /// expires. Never-written keys are at version 0.
    pub fn version(&mut self, key: &[u8]) -> u64 {
        self.purge_expired(key);
        self.versions.get(key).copied().unwrap_or(0)
    }

    pub fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Data::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Overwrites `key` with a string, replacing any previous type and TTL.
    pub fn set(&mut self, key: &[u8], value: Vec<u8>, ttl: Option<Duration>) {
        let mut entry = Entry::new(Data::Str(value));
        entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.to_vec(), entry);
        self.touch(key);
    }

    pub fn incr_by(&mut self, key: &[u8], delta: i64) -> StoreResult<i64> {
        let current = match self.get(key)? {
            Some(raw) => parse_i64(&raw).ok_or(StoreError::NotInteger)?,
            None => 0,
        };
        let next = current.checked_add(delta).ok_or(StoreError::Overflow)?;
        let expires_at = self.entries.get(key).and_then(|entry| entry.expires_at);
        let mut entry = Entry::new(Data::Str(next.to_string().into_bytes()));
        entry.expires_at = expires_at;
        self.entries.insert(key.to_vec(), entry);
        self.touch(key);
        Ok(next)
    }

    pub fn del(&mut self, key: &[u8]) -> bool {
        self.purge_expired(key);
        if self.entries.remove(key).is_some() {
            self.touch(key);
            true
        } else {
            false
        }
    }

    /// Attaches a TTL. Returns false when the key does not exist.
    pub fn expire(&mut self, key: &[u8], ttl: Duration) -> bool {
        self.purge_expired(key);
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                self.touch(key);
                true
            }
            None => false,
        }
    }

    /// Remaining TTL in whole seconds, `-1` without expiry, `-2` when missing.
    pub fn ttl(&mut self, key: &[u8]) -> i64 {
        self.purge_expired(key);
        match self.entries.get(key) {
            None => -2,
            Some(Entry {
                expires_at: None, ..
            }) => -1,
            Some(Entry {
                expires_at: Some(deadline),
                ..
            }) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                // Round up so a fresh EX 60 reports 60, not 59.
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                secs as i64
            }
        }
    }

    /// Sets a hash field. Returns true when the field is new.
    pub fn hset(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> StoreResult<bool> {
        let hash = self.hash_mut(key)?;
        let added = hash.insert(field.to_vec(), value.to_vec()).is_none();
        self.touch(key);
        Ok(added)
    }

    pub fn hget(&mut self, key: &[u8], field: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Data::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Fields in field order.
    pub fn hgetall(&mut self, key: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(Data::Hash(hash)) => Ok(hash
                .iter()
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    pub fn hincr_by(&mut self, key: &[u8], field: &[u8], delta: i64) -> StoreResult<i64> {
        let hash = self.hash_mut(key)?;
        let current = match hash.get(field) {
            Some(raw) => parse_i64(raw).ok_or(StoreError::NotInteger)?,
            None => 0,
        };
        let next = current.checked_add(delta).ok_or(StoreError::Overflow)?;
        hash.insert(field.to_vec(), next.to_string().into_bytes());
        self.touch(key);
        Ok(next)
    }

    /// Pushes values one by one at the head (`front`) or tail. Returns the
    /// new length.
    pub fn push(&mut self, key: &[u8], values: &[Vec<u8>], front: bool) -> StoreResult<usize> {
        let list = self.list_mut(key)?;
        for value in values {
            if front {
                list.push_front(value.clone());
            } else {
                list.push_back(value.clone());
            }
        }
        let len = list.len();
        self.touch(key);
        Ok(len)
    }

    pub fn pop(&mut self, key: &[u8], front: bool) -> StoreResult<Option<Vec<u8>>> {
        let popped = match self.live_mut(key) {
            None => return Ok(None),
            Some(Data::List(list)) => {
                if front {
                    list.pop_front()
                } else {
                    list.pop_back()
                }
            }
            Some(_) => return Err(StoreError::WrongType),
        };
        if popped.is_some() {
            self.drop_if_empty(key);
            self.touch(key);
        }
        Ok(popped)
    }

    pub fn lrange(&mut self, key: &[u8], start: i64, stop: i64) -> StoreResult<Vec<Vec<u8>>> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(Data::List(list)) => Ok(match normalize_range(start, stop, list.len()) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    pub fn llen(&mut self, key: &[u8]) -> StoreResult<usize> {
        match self.live(key) {
            None => Ok(0),
            Some(Data::List(list)) => Ok(list.len()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Adds members. Returns how many were not already present.
    pub fn sadd(&mut self, key: &[u8], members: &[Vec<u8>]) -> StoreResult<usize> {
        let set = self.set_mut(key)?;
        let added = members
            .iter()
            .filter(|member| set.insert(member.to_vec()))
            .count();
        self.touch(key);
        Ok(added)
    }

    /// Members in byte order.
    pub fn smembers(&mut self, key: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(Data::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    pub fn sismember(&mut self, key: &[u8], member: &[u8]) -> StoreResult<bool> {
        match self.live(key) {
            None => Ok(false),
            Some(Data::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    pub fn scard(&mut self, key: &[u8]) -> StoreResult<usize> {
        match self.live(key) {
            None => Ok(0),
            Some(Data::Set(set)) => Ok(set.len()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    /// Adds or rescores members. Returns how many were new.
    pub fn zadd(&mut self, key: &[u8], members: &[(f64, Vec<u8>)]) -> StoreResult<usize> {
        let zset = self.zset_mut(key)?;
        let mut added = 0;
        for (score, member) in members {
            if zset.insert(member.clone(), *score).is_none() {
                added += 1;
            }
        }
        self.touch(key);
        Ok(added)
    }

    /// Members with scores by rank; `reverse` ranks from the highest score.
    pub fn zrange(
        &mut self,
        key: &[u8],
        start: i64,
        stop: i64,
        reverse: bool,
    ) -> StoreResult<Vec<(Vec<u8>, f64)>> {
        let mut ranked = self.ranked(key)?;
        if reverse {
            ranked.reverse();
        }
        Ok(match normalize_range(start, stop, ranked.len()) {
            Some((from, to)) => ranked.drain(from..=to).collect(),
            None => Vec::new(),
        })
    }

    pub fn zscore(&mut self, key: &[u8], member: &[u8]) -> StoreResult<Option<f64>> {
        match self.live(key) {
            None => Ok(None),
            Some(Data::ZSet(zset)) => Ok(zset.get(member).copied()),
            Some(_) => Err(StoreError::WrongType),
        }
    }

    pub fn zrank(&mut self, key: &[u8], member: &[u8]) -> StoreResult<Option<usize>> {
        Ok(self
            .ranked(key)?
            .iter()
            .position(|(candidate, _)| candidate.as_slice() == member))
    }

    /// Removes every key; each one gets a new version.
    pub fn flush(&mut self) {
        let keys: Vec<Vec<u8>> = self.entries.keys().cloned().collect();
        self.entries.clear();
        for key in keys {
            self.touch(&key);
        }
    }

    fn ranked(&mut self, key: &[u8]) -> StoreResult<Vec<(Vec<u8>, f64)>> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(Data::ZSet(zset)) => {
                let mut ranked: Vec<(Vec<u8>, f64)> = zset
                    .iter()
                    .map(|(member, score)| (member.clone(), *score))
                    .collect();
                ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(ranked)
            }
            Some(_) => Err(StoreError::WrongType),
        }
    }

    fn touch(&mut self, key: &[u8]) {
        self.clock += 1;
        self.versions.insert(key.to_vec(), self.clock);
    }

    fn purge_expired(&mut self, key: &[u8]) {
        let expired = self
            .entries
            .get(key)
            .map(|entry| entry.is_expired(Instant::now()))
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
            self.touch(key);
        }
    }

    fn purge_all_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<Vec<u8>> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.entries.remove(&key);
            self.touch(&key);
        }
    }

    fn live(&mut self, key: &[u8]) -> Option<&Data> {
        self.purge_expired(key);
        self.entries.get(key).map(|entry| &entry.data)
    }

    fn live_mut(&mut self, key: &[u8]) -> Option<&mut Data> {
        self.purge_expired(key);
        self.entries.get_mut(key).map(|entry| &mut entry.data)
    }

    fn drop_if_empty(&mut self, key: &[u8]) {
        let empty = match self.entries.get(key).map(|entry| &entry.data) {
            Some(Data::List(list)) => list.is_empty(),
            Some(Data::Set(set)) => set.is_empty(),
            Some(Data::Hash(hash)) => hash.is_empty(),
            Some(Data::ZSet(zset)) => zset.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn data_or_insert(&mut self, key: &[u8], empty: fn() -> Data) -> &mut Data {
        self.purge_expired(key);
        &mut self
            .entries
            .entry(key.to_vec())
            .or_insert_with(|| Entry::new(empty()))
            .data
    }

    fn hash_mut(&mut self, key: &[u8]) -> StoreResult<&mut BTreeMap<Vec<u8>, Vec<u8>>> {
        match self.data_or_insert(key, || Data::Hash(BTreeMap::new())) {
            Data::Hash(hash) => Ok(hash),
            _ => Err(StoreError::WrongType),
        }
    }

    fn list_mut(&mut self, key: &[u8]) -> StoreResult<&mut VecDeque<Vec<u8>>> {
        match self.data_or_insert(key, || Data::List(VecDeque::new())) {
            Data::List(list) => Ok(list),
            _ => Err(StoreError::WrongType),
        }
    }

    fn set_mut(&mut self, key: &[u8]) -> StoreResult<&mut BTreeSet<Vec<u8>>> {
        match self.data_or_insert(key, || Data::Set(BTreeSet::new())) {
            Data::Set(set) => Ok(set),
            _ => Err(StoreError::WrongType),
        }
    }

    fn zset_mut(&mut self, key: &[u8]) -> StoreResult<&mut HashMap<Vec<u8>, f64>> {
        match self.data_or_insert(key, || Data::ZSet(HashMap::new())) {
            Data::ZSet(zset) => Ok(zset),
            _ => Err(StoreError::WrongType),
        }
    }
}

pub(crate) fn parse_i64(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

pub(crate) fn parse_f64(raw: &[u8]) -> Option<f64> {
    let value: f64 = std::str::from_utf8(raw).ok()?.parse().ok()?;
    if value.is_nan() {
        None
    } else {
        Some(value)
    }
}

/// Resolves inclusive `start..=stop` with negative offsets from the end.
fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_bump_versions() {
        let mut keys = Keyspace::new();
        assert_eq!(keys.version(b"a"), 0);
        keys.set(b"a", b"1".to_vec(), None);
        let first = keys.version(b"a");
        assert!(first > 0);
        keys.incr_by(b"a", 1).unwrap();
        assert!(keys.version(b"a") > first);
        assert_eq!(keys.get(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn delete_bumps_version_only_when_present() {
        let mut keys = Keyspace::new();
        assert!(!keys.del(b"a"));
        assert_eq!(keys.version(b"a"), 0);
        keys.set(b"a", b"x".to_vec(), None);
        let before = keys.version(b"a");
        assert!(keys.del(b"a"));
        assert!(keys.version(b"a") > before);
    }

    #[test]
    fn wrong_type_is_rejected() {
        let mut keys = Keyspace::new();
        keys.push(b"list", &[b"x".to_vec()], false).unwrap();
        assert_eq!(keys.get(b"list"), Err(StoreError::WrongType));
        assert_eq!(keys.incr_by(b"list", 1), Err(StoreError::WrongType));
    }

    #[test]
    fn incr_rejects_non_numeric() {
        let mut keys = Keyspace::new();
        keys.set(b"name", b"alice".to_vec(), None);
        assert_eq!(keys.incr_by(b"name", 1), Err(StoreError::NotInteger));
    }

    #[test]
    fn ttl_states() {
        let mut keys = Keyspace::new();
        assert_eq!(keys.ttl(b"missing"), -2);
        keys.set(b"plain", b"v".to_vec(), None);
        assert_eq!(keys.ttl(b"plain"), -1);
        keys.set(b"temp", b"v".to_vec(), Some(Duration::from_secs(60)));
        assert_eq!(keys.ttl(b"temp"), 60);
    }

    #[test]
    fn expired_keys_disappear() {
        let mut keys = Keyspace::new();
        keys.set(b"temp", b"v".to_vec(), Some(Duration::ZERO));
        assert_eq!(keys.get(b"temp").unwrap(), None);
        assert_eq!(keys.ttl(b"temp"), -2);
    }

    #[test]
    fn list_ranges_follow_redis_offsets() {
        let mut keys = Keyspace::new();
        let values: Vec<Vec<u8>> = ["a", "b", "c"].iter().map(|v| v.as_bytes().to_vec()).collect();
        keys.push(b"l", &values, false).unwrap();
        assert_eq!(keys.lrange(b"l", 0, -1).unwrap().len(), 3);
        assert_eq!(keys.lrange(b"l", -2, -1).unwrap(), vec![b"b".to_vec(), b"c".to_vec()]);
        assert!(keys.lrange(b"l", 5, 10).unwrap().is_empty());
    }

    #[test]
    fn lpush_reverses_argument_order() {
        let mut keys = Keyspace::new();
        keys.push(b"l", &[b"a".to_vec(), b"b".to_vec()], true).unwrap();
        assert_eq!(keys.lrange(b"l", 0, -1).unwrap(), vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn popping_last_element_removes_key() {
        let mut keys = Keyspace::new();
        keys.push(b"l", &[b"a".to_vec()], false).unwrap();
        assert_eq!(keys.pop(b"l", true).unwrap(), Some(b"a".to_vec()));
        assert_eq!(keys.ttl(b"l"), -2);
    }

    #[test]
    fn sorted_set_ranks() {
        let mut keys = Keyspace::new();
        keys.zadd(
            b"board",
            &[(100.0, b"alice".to_vec()), (85.0, b"bob".to_vec()), (92.0, b"cara".to_vec())],
        )
        .unwrap();
        let top = keys.zrange(b"board", 0, 0, true).unwrap();
        assert_eq!(top, vec![(b"alice".to_vec(), 100.0)]);
        assert_eq!(keys.zrank(b"board", b"bob").unwrap(), Some(0));
        assert_eq!(keys.zscore(b"board", b"cara").unwrap(), Some(92.0));
    }
}
