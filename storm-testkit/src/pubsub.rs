//! Channel and pattern subscriptions shared by all connections.
//!
//! Each subscribed connection registers an unbounded sender; `publish` pushes
//! pre-encoded frames into it, so delivery order per subscriber follows the
//! order in which `PUBLISH` commands were handled.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use crate::protocol::Value;

struct Subscriber {
    sender: UnboundedSender<Vec<u8>>,
    channels: BTreeSet<Vec<u8>>,
    patterns: BTreeSet<Vec<u8>>,
}

/// Registry of live subscribers keyed by connection id.
#[derive(Default)]
pub struct PubSubRegistry {
    subscribers: HashMap<u64, Subscriber>,
}

impl PubSubRegistry {
    /// Adds channels (or patterns) for `conn` and returns one confirmation
    /// frame per name.
    pub fn subscribe(
        &mut self,
        conn: u64,
        sender: &UnboundedSender<Vec<u8>>,
        names: &[Vec<u8>],
        pattern: bool,
    ) -> Vec<u8> {
        let subscriber = self.subscribers.entry(conn).or_insert_with(|| Subscriber {
            sender: sender.clone(),
            channels: BTreeSet::new(),
            patterns: BTreeSet::new(),
        });

        let kind = if pattern { "psubscribe" } else { "subscribe" };
        let mut out = Vec::new();
        for name in names {
            if pattern {
                subscriber.patterns.insert(name.clone());
            } else {
                subscriber.channels.insert(name.clone());
            }
            let count = subscriber.channels.len() + subscriber.patterns.len();
            confirmation(kind, Value::Bulk(name.clone()), count).encode(&mut out);
        }
        out
    }

    /// Removes the named channels (or patterns), or all of them when `names`
    /// is empty. Returns the confirmation frames.
    pub fn unsubscribe(&mut self, conn: u64, names: &[Vec<u8>], pattern: bool) -> Vec<u8> {
        let kind = if pattern { "punsubscribe" } else { "unsubscribe" };
        let mut out = Vec::new();

        let subscriber = match self.subscribers.get_mut(&conn) {
            Some(subscriber) => subscriber,
            None => {
                confirmation(kind, Value::Nil, 0).encode(&mut out);
                return out;
            }
        };

        let set = if pattern {
            &mut subscriber.patterns
        } else {
            &mut subscriber.channels
        };
        let targets: Vec<Vec<u8>> = if names.is_empty() {
            set.iter().cloned().collect()
        } else {
            names.to_vec()
        };

        if targets.is_empty() {
            let count = subscriber.channels.len() + subscriber.patterns.len();
            confirmation(kind, Value::Nil, count).encode(&mut out);
        }
        for name in targets {
            if pattern {
                subscriber.patterns.remove(&name);
            } else {
                subscriber.channels.remove(&name);
            }
            let count = subscriber.channels.len() + subscriber.patterns.len();
            confirmation(kind, Value::Bulk(name), count).encode(&mut out);
        }

        if subscriber.channels.is_empty() && subscriber.patterns.is_empty() {
            self.subscribers.remove(&conn);
        }
        out
    }

    /// Number of channels plus patterns held by `conn`.
    pub fn subscription_count(&self, conn: u64) -> usize {
        self.subscribers
            .get(&conn)
            .map(|subscriber| subscriber.channels.len() + subscriber.patterns.len())
            .unwrap_or(0)
    }

    /// Delivers `payload` and returns the number of receiving subscriptions.
    pub fn publish(&self, channel: &[u8], payload: &[u8]) -> i64 {
        let mut receivers = 0;
        for subscriber in self.subscribers.values() {
            if subscriber.channels.contains(channel) {
                let frame = Value::Array(vec![
                    Value::bulk("message"),
                    Value::bulk(channel),
                    Value::bulk(payload),
                ]);
                if subscriber.sender.send(frame.to_bytes()).is_ok() {
                    receivers += 1;
                }
            }
            for pattern in &subscriber.patterns {
                if glob_match(pattern, channel) {
                    let frame = Value::Array(vec![
                        Value::bulk("pmessage"),
                        Value::bulk(pattern),
                        Value::bulk(channel),
                        Value::bulk(payload),
                    ]);
                    if subscriber.sender.send(frame.to_bytes()).is_ok() {
                        receivers += 1;
                    }
                }
            }
        }
        trace!(channel = %String::from_utf8_lossy(channel), receivers, "published");
        receivers
    }

    pub fn remove(&mut self, conn: u64) {
        self.subscribers.remove(&conn);
    }
}

fn confirmation(kind: &str, name: Value, count: usize) -> Value {
    Value::Array(vec![Value::bulk(kind), name, Value::Integer(count as i64)])
}

/// Glob matching with `*`, `?` and `[...]` classes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') => (0..=text.len()).any(|skip| glob_match(&pattern[1..], &text[skip..])),
        Some(b'?') => !text.is_empty() && glob_match(&pattern[1..], &text[1..]),
        Some(b'[') => {
            let close = match pattern.iter().position(|&b| b == b']') {
                Some(close) => close,
                None => return !text.is_empty() && text[0] == b'[' && glob_match(&pattern[1..], &text[1..]),
            };
            !text.is_empty()
                && pattern[1..close].contains(&text[0])
                && glob_match(&pattern[close + 1..], &text[1..])
        }
        Some(&literal) => {
            !text.is_empty() && text[0] == literal && glob_match(&pattern[1..], &text[1..])
        }
    }
}
