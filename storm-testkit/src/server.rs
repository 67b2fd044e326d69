//! # TCP Server
//!
//! Accept RESP2 connections, parse commands, and dispatch them against the
//! shared keyspace, script registry and subscription registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::commands::{self, wrong_arity};
use crate::keyspace::Keyspace;
use crate::protocol::{RespError, RespParser, Value};
use crate::pubsub::PubSubRegistry;
use crate::scripting::{self, ScriptRegistry};

/// State shared by every connection.
#[derive(Default)]
pub(crate) struct Shared {
    store: Mutex<Keyspace>,
    scripts: Mutex<ScriptRegistry>,
    pubsub: Mutex<PubSubRegistry>,
    next_conn: AtomicU64,
    connected: AtomicU64,
}

impl Shared {
    pub(crate) fn store(&self) -> MutexGuard<'_, Keyspace> {
        lock(&self.store)
    }

    pub(crate) fn scripts(&self) -> MutexGuard<'_, ScriptRegistry> {
        lock(&self.scripts)
    }

    fn pubsub(&self) -> MutexGuard<'_, PubSubRegistry> {
        lock(&self.pubsub)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking script handler must not take the whole server down.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-connection transaction state.
struct Session {
    id: u64,
    push_tx: UnboundedSender<Vec<u8>>,
    watched: Vec<(Vec<u8>, u64)>,
    queued: Option<Vec<Vec<Vec<u8>>>>,
    queue_failed: bool,
}

impl Session {
    fn reset_transaction(&mut self) {
        self.watched.clear();
        self.queued = None;
        self.queue_failed = false;
    }
}

/// Accepts connections until `shutdown` fires.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, shared).await {
                            debug!(%peer, error = %err, "connection closed with error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    }
    debug!("accept loop stopped");
}

/// Handles a single TCP client connection.
async fn handle_connection(mut stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let id = shared.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    let mut session = Session {
        id,
        push_tx,
        watched: Vec::new(),
        queued: None,
        queue_failed: false,
    };

    shared.connected.fetch_add(1, Ordering::Relaxed);
    let result = serve(&mut stream, &shared, &mut session, &mut push_rx).await;
    shared.connected.fetch_sub(1, Ordering::Relaxed);
    shared.pubsub().remove(id);
    result
}

async fn serve(
    stream: &mut TcpStream,
    shared: &Shared,
    session: &mut Session,
    push_rx: &mut UnboundedReceiver<Vec<u8>>,
) -> std::io::Result<()> {
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut parser = RespParser::new();

    loop {
        tokio::select! {
            read = stream.read_buf(&mut buffer) => {
                if read? == 0 {
                    return Ok(());
                }

                let mut out = Vec::new();
                loop {
                    match parser.parse(&mut buffer) {
                        Ok(Some(args)) => dispatch(&args, session, shared, &mut out),
                        Ok(None) => break,
                        Err(RespError::Protocol) => {
                            Value::error("ERR Protocol error").encode(&mut out);
                            stream.write_all(&out).await?;
                            return Ok(());
                        }
                    }
                }
                if !out.is_empty() {
                    stream.write_all(&out).await?;
                }
            }
            Some(frame) = push_rx.recv() => {
                stream.write_all(&frame).await?;
            }
        }
    }
}

fn dispatch(args: &[Vec<u8>], session: &mut Session, shared: &Shared, out: &mut Vec<u8>) {
    let name = match args.first() {
        Some(name) => String::from_utf8_lossy(name).to_ascii_uppercase(),
        None => return Value::error("ERR empty command").encode(out),
    };

    let subscribed = shared.pubsub().subscription_count(session.id) > 0;
    if subscribed
        && !matches!(
            name.as_str(),
            "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE" | "PING" | "QUIT"
        )
    {
        return Value::error(format!(
            "ERR Can't execute '{}': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT are allowed in this context",
            name.to_ascii_lowercase()
        ))
        .encode(out);
    }

    if let Some(queue) = session.queued.as_mut() {
        if !matches!(name.as_str(), "EXEC" | "DISCARD" | "MULTI" | "WATCH") {
            if is_queueable(&name) {
                queue.push(args.to_vec());
                return Value::Status("QUEUED".into()).encode(out);
            }
            session.queue_failed = true;
            return Value::error(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(&args[0])
            ))
            .encode(out);
        }
    }

    let reply = match name.as_str() {
        "PING" | "QUIT" | "PUBLISH" | "EVAL" | "EVALSHA" => {
            let mut store = shared.store();
            run_atomic(shared, &mut store, &name, args)
        }
        "INFO" => info(shared),
        "MULTI" => {
            if session.queued.is_some() {
                Value::error("ERR MULTI calls can not be nested")
            } else {
                session.queued = Some(Vec::new());
                Value::ok()
            }
        }
        "EXEC" => exec(session, shared),
        "DISCARD" => {
            if session.queued.is_none() {
                Value::error("ERR DISCARD without MULTI")
            } else {
                session.reset_transaction();
                Value::ok()
            }
        }
        "WATCH" => watch(args, session, shared),
        "UNWATCH" => {
            session.watched.clear();
            Value::ok()
        }
        "SUBSCRIBE" | "PSUBSCRIBE" => {
            if args.len() < 2 {
                wrong_arity(&name)
            } else {
                let frames = shared.pubsub().subscribe(
                    session.id,
                    &session.push_tx,
                    &args[1..],
                    name == "PSUBSCRIBE",
                );
                out.extend_from_slice(&frames);
                return;
            }
        }
        "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
            let frames = shared
                .pubsub()
                .unsubscribe(session.id, &args[1..], name == "PUNSUBSCRIBE");
            out.extend_from_slice(&frames);
            return;
        }
        "SCRIPT" => script_command(args, shared),
        _ => commands::apply(&mut shared.store(), args),
    };
    reply.encode(out);
}

fn is_queueable(name: &str) -> bool {
    commands::is_data_command(name) || matches!(name, "PING" | "PUBLISH" | "EVAL" | "EVALSHA")
}

/// Runs a command that may execute inside `EXEC` with the keyspace locked.
fn run_atomic(shared: &Shared, store: &mut Keyspace, name: &str, args: &[Vec<u8>]) -> Value {
    match name {
        "PING" => match args.len() {
            1 => Value::Status("PONG".into()),
            2 => Value::Bulk(args[1].clone()),
            _ => wrong_arity(name),
        },
        "QUIT" => Value::ok(),
        "PUBLISH" => {
            if args.len() != 3 {
                return wrong_arity(name);
            }
            Value::Integer(shared.pubsub().publish(&args[1], &args[2]))
        }
        "EVAL" | "EVALSHA" => {
            if args.len() < 3 {
                return wrong_arity(name);
            }
            let (keys, script_args) = match scripting::split_keys(&args[2..]) {
                Ok(split) => split,
                Err(err) => return err,
            };
            let body = String::from_utf8_lossy(&args[1]).into_owned();
            let handler = {
                let mut scripts = shared.scripts();
                if name == "EVAL" {
                    scripts.by_source(&body)
                } else {
                    scripts.by_sha(&body)
                }
            };
            match handler {
                Ok(handler) => scripting::run(&handler, store, keys, script_args),
                Err(err) => err,
            }
        }
        _ => commands::apply(store, args),
    }
}

fn watch(args: &[Vec<u8>], session: &mut Session, shared: &Shared) -> Value {
    if session.queued.is_some() {
        return Value::error("ERR WATCH inside MULTI is not allowed");
    }
    if args.len() < 2 {
        return wrong_arity("WATCH");
    }
    let mut store = shared.store();
    for key in &args[1..] {
        let version = store.version(key);
        session.watched.push((key.clone(), version));
    }
    Value::ok()
}

fn exec(session: &mut Session, shared: &Shared) -> Value {
    let queued = match session.queued.take() {
        Some(queued) => queued,
        None => return Value::error("ERR EXEC without MULTI"),
    };
    let failed = session.queue_failed;
    let watched = std::mem::take(&mut session.watched);
    session.reset_transaction();

    if failed {
        return Value::error("EXECABORT Transaction discarded because of previous errors.");
    }

    let mut store = shared.store();
    let conflict = watched
        .iter()
        .any(|(key, version)| store.version(key) != *version);
    if conflict {
        debug!(conn = session.id, "exec aborted by watched key change");
        return Value::NilArray;
    }

    let replies = queued
        .iter()
        .map(|args| {
            let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
            run_atomic(shared, &mut store, &name, args)
        })
        .collect();
    Value::Array(replies)
}

fn script_command(args: &[Vec<u8>], shared: &Shared) -> Value {
    let sub = match args.get(1) {
        Some(sub) => String::from_utf8_lossy(sub).to_ascii_uppercase(),
        None => return wrong_arity("SCRIPT"),
    };
    let mut scripts = shared.scripts();
    match sub.as_str() {
        "LOAD" if args.len() == 3 => Value::bulk(scripts.load(&String::from_utf8_lossy(&args[2]))),
        "EXISTS" if args.len() >= 3 => Value::Array(
            args[2..]
                .iter()
                .map(|sha| Value::Integer(i64::from(scripts.exists(&String::from_utf8_lossy(sha)))))
                .collect(),
        ),
        "FLUSH" => {
            scripts.flush();
            Value::ok()
        }
        "LOAD" | "EXISTS" => wrong_arity("SCRIPT"),
        _ => Value::error(format!("ERR unknown subcommand '{}'", sub.to_ascii_lowercase())),
    }
}

fn info(shared: &Shared) -> Value {
    let keys = shared.store().len();
    let clients = shared.connected.load(Ordering::Relaxed);
    Value::bulk(format!(
        "# Server\r\nredis_version:7.0.0\r\nstorm_testkit:1\r\n\r\n# Clients\r\nconnected_clients:{}\r\n\r\n# Keyspace\r\ndb0:keys={}\r\n",
        clients, keys
    ))
}
