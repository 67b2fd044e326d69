//! # Subscription Listener
//!
//! Purpose: Deliver messages published to channels (or patterns) to the
//! caller without holding up any other connection.
//!
//! ## Design Principles
//! 1. **Dedicated Connection**: A subscription owns its own socket; pooled
//!    connections never enter subscribe mode.
//! 2. **Listener Thread + Channel**: A background thread reads pushes and
//!    forwards them over an mpsc channel, so delivery order equals arrival
//!    order on the one socket.
//! 3. **Structured Cancellation**: `unsubscribe` ends the stream once the
//!    store confirms zero remaining subscriptions; `close` tears the socket
//!    down. Application sentinels such as a "STOP" payload belong in the
//!    caller's handler (`ListenControl::Stop`), not in the transport.
//!
//! ## Structure Overview
//!
//! ```text
//! Subscription (caller thread)            listener thread
//!   ├── writer: TcpStream clone  ──▶ store ──▶ Connection::receive
//!   └── receiver: mpsc::Receiver ◀────────────── Sender<ClientResult<Message>>
//! ```

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info};

use crate::cmd::Cmd;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::reply::{FromReply, Reply};
use crate::resp::encode_command;

/// A message published to a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    pub payload: Bytes,
}

impl Message {
    /// Payload as text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Handler verdict for `Subscription::listen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenControl {
    Continue,
    Stop,
}

enum Push {
    Message(Message),
    Confirmation { kind: String, remaining: i64 },
    Other,
}

/// Live subscription on a dedicated connection.
pub struct Subscription {
    channels: Vec<String>,
    patterns: Vec<String>,
    writer: TcpStream,
    write_buf: BytesMut,
    receiver: Receiver<ClientResult<Message>>,
    listener: Option<JoinHandle<()>>,
    closing: Arc<AtomicBool>,
    ended: bool,
}

impl Subscription {
    /// Opens a dedicated connection and subscribes to `channels` and
    /// `patterns`. Returns once the store has confirmed every subscription.
    pub fn open(config: &ClientConfig, channels: &[&str], patterns: &[&str]) -> ClientResult<Self> {
        if channels.is_empty() && patterns.is_empty() {
            return Err(ClientError::InvalidArgument(
                "a subscription needs at least one channel or pattern".into(),
            ));
        }

        // A quiet channel is not a failure; the listener must block freely.
        let mut listen_config = config.clone();
        listen_config.read_timeout = None;
        let mut conn = Connection::open(&listen_config)?;

        let mut expected = 0;
        if !channels.is_empty() {
            conn.send(&Cmd::subscribe(channels))?;
            expected += channels.len();
        }
        if !patterns.is_empty() {
            conn.send(&Cmd::psubscribe(patterns))?;
            expected += patterns.len();
        }

        let mut early = Vec::new();
        let mut confirmed = 0;
        while confirmed < expected {
            match classify(conn.receive()?)? {
                Push::Confirmation { .. } => confirmed += 1,
                Push::Message(message) => early.push(message),
                Push::Other => {}
            }
        }

        let writer = conn.try_clone_stream()?;
        let closing = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::channel();
        let listener = {
            let closing = Arc::clone(&closing);
            thread::Builder::new()
                .name("storm-subscriber".into())
                .spawn(move || run_listener(conn, sender, closing, early))?
        };

        info!(channels = channels.len(), patterns = patterns.len(), "subscribed");
        Ok(Subscription {
            channels: channels.iter().map(|name| name.to_string()).collect(),
            patterns: patterns.iter().map(|name| name.to_string()).collect(),
            writer,
            write_buf: BytesMut::with_capacity(64),
            receiver,
            listener: Some(listener),
            closing,
            ended: false,
        })
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// True once the stream has ended and every buffered message was taken.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Blocks until a message arrives or the stream ends (`Ok(None)`).
    pub fn next_message(&mut self) -> ClientResult<Option<Message>> {
        if self.ended {
            return Ok(None);
        }
        match self.receiver.recv() {
            Ok(item) => item.map(Some),
            Err(_) => {
                self.ended = true;
                Ok(None)
            }
        }
    }

    /// Like `next_message`, but gives up with `ClientError::Timeout`.
    pub fn next_message_timeout(&mut self, timeout: Duration) -> ClientResult<Option<Message>> {
        if self.ended {
            return Ok(None);
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => item.map(Some),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                self.ended = true;
                Ok(None)
            }
        }
    }

    /// Feeds messages to `handler` until it answers `Stop` or the stream
    /// ends. On `Stop` the subscription is cancelled with `unsubscribe`.
    ///
    /// Returns the number of messages handed to `handler`.
    pub fn listen<F>(&mut self, mut handler: F) -> ClientResult<usize>
    where
        F: FnMut(&Message) -> ListenControl,
    {
        let mut delivered = 0;
        while let Some(message) = self.next_message()? {
            delivered += 1;
            if handler(&message) == ListenControl::Stop {
                self.unsubscribe()?;
                break;
            }
        }
        Ok(delivered)
    }

    /// Drops every channel and pattern subscription.
    ///
    /// Messages already received stay readable; the stream ends after the
    /// store confirms the last unsubscribe.
    pub fn unsubscribe(&mut self) -> ClientResult<()> {
        if !self.channels.is_empty() {
            self.send(&Cmd::unsubscribe::<&str>(&[]))?;
        }
        if !self.patterns.is_empty() {
            self.send(&Cmd::punsubscribe::<&str>(&[]))?;
        }
        debug!("unsubscribe requested");
        Ok(())
    }

    /// Shuts the dedicated connection down and waits for the listener.
    pub fn close(&mut self) {
        self.closing.store(true, Ordering::Release);
        if let Err(err) = self.writer.shutdown(Shutdown::Both) {
            debug!(error = %err, "subscription socket already closed");
        }
        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                debug!("subscription listener panicked");
            }
        }
    }

    fn send(&mut self, cmd: &Cmd) -> ClientResult<()> {
        self.write_buf.clear();
        encode_command(cmd, &mut self.write_buf);
        self.writer.write_all(&self.write_buf)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_listener(
    mut conn: Connection,
    sender: Sender<ClientResult<Message>>,
    closing: Arc<AtomicBool>,
    early: Vec<Message>,
) {
    for message in early {
        if sender.send(Ok(message)).is_err() {
            return;
        }
    }

    loop {
        let reply = match conn.receive_push() {
            Ok(Some(reply)) => reply,
            // The store hung up between pushes: the stream simply ends.
            Ok(None) => break,
            Err(err) => {
                if !closing.load(Ordering::Acquire) {
                    let _ = sender.send(Err(err));
                }
                break;
            }
        };

        match classify(reply) {
            Ok(Push::Message(message)) => {
                if sender.send(Ok(message)).is_err() {
                    // Receiver dropped; nobody is listening anymore.
                    break;
                }
            }
            Ok(Push::Confirmation { kind, remaining }) => {
                if kind.ends_with("unsubscribe") && remaining <= 0 {
                    break;
                }
            }
            Ok(Push::Other) => {}
            Err(err) => {
                if sender.send(Err(err)).is_err() {
                    break;
                }
            }
        }
    }
    debug!(conn = conn.id(), "subscription listener finished");
}

fn classify(reply: Reply) -> ClientResult<Push> {
    let mut items = match reply {
        Reply::Array(items) if !items.is_empty() => items.into_iter(),
        Reply::Error(err) => return Err(ClientError::Server(err)),
        _ => return Ok(Push::Other),
    };

    let kind = match items.next() {
        Some(first) => String::from_reply(first)?.to_ascii_lowercase(),
        None => return Ok(Push::Other),
    };

    match kind.as_str() {
        "message" => {
            let channel = next_text(&mut items)?;
            let payload = next_payload(&mut items)?;
            Ok(Push::Message(Message {
                channel,
                pattern: None,
                payload,
            }))
        }
        "pmessage" => {
            let pattern = next_text(&mut items)?;
            let channel = next_text(&mut items)?;
            let payload = next_payload(&mut items)?;
            Ok(Push::Message(Message {
                channel,
                pattern: Some(pattern),
                payload,
            }))
        }
        "subscribe" | "psubscribe" | "unsubscribe" | "punsubscribe" => {
            // Second slot is the channel name (nil for a bare unsubscribe).
            items.next();
            let remaining = match items.next() {
                Some(count) => i64::from_reply(count)?,
                None => 0,
            };
            Ok(Push::Confirmation { kind, remaining })
        }
        _ => Ok(Push::Other),
    }
}

fn next_text(items: &mut impl Iterator<Item = Reply>) -> ClientResult<String> {
    match items.next() {
        Some(item) => String::from_reply(item),
        None => Err(ClientError::Protocol("truncated pub/sub push".into())),
    }
}

fn next_payload(items: &mut impl Iterator<Item = Reply>) -> ClientResult<Bytes> {
    match items.next() {
        Some(item) => Bytes::from_reply(item),
        None => Err(ClientError::Protocol("truncated pub/sub push".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(text: &str) -> Reply {
        Reply::Bulk(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[test]
    fn classifies_channel_message() {
        let push = classify(Reply::Array(vec![bulk("message"), bulk("news"), bulk("hi")])).unwrap();
        match push {
            Push::Message(message) => {
                assert_eq!(message.channel, "news");
                assert_eq!(message.pattern, None);
                assert_eq!(message.payload_str(), Some("hi"));
            }
            _ => panic!("expected message"),
        }
    }

    #[test]
    fn classifies_pattern_message() {
        let push = classify(Reply::Array(vec![
            bulk("pmessage"),
            bulk("news.*"),
            bulk("news.eu"),
            bulk("x"),
        ]))
        .unwrap();
        match push {
            Push::Message(message) => {
                assert_eq!(message.pattern.as_deref(), Some("news.*"));
                assert_eq!(message.channel, "news.eu");
            }
            _ => panic!("expected pattern message"),
        }
    }

    #[test]
    fn classifies_final_unsubscribe() {
        let push = classify(Reply::Array(vec![
            Reply::Status("unsubscribe".into()),
            Reply::Nil,
            Reply::Integer(0),
        ]))
        .unwrap();
        match push {
            Push::Confirmation { kind, remaining } => {
                assert_eq!(kind, "unsubscribe");
                assert_eq!(remaining, 0);
            }
            _ => panic!("expected confirmation"),
        }
    }

    #[test]
    fn truncated_message_is_protocol_error() {
        let result = classify(Reply::Array(vec![bulk("message"), bulk("news")]));
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }
}
