//! # Connection
//!
//! Purpose: One logical channel to the store. Sends one command and reads one
//! reply, or queues commands in batch mode and flushes them as a single
//! frame.
//!
//! ## Design Principles
//! 1. **Single Driver**: A connection is `&mut`-driven; concurrent use needs a
//!    second connection, never a lock around this one.
//! 2. **No Hidden Retries**: Failures go straight back to the caller.
//! 3. **Poison on Failure**: Any transport or framing error marks the
//!    connection broken so a desynchronized stream is never reused.
//! 4. **Buffer Reuse**: Read and write buffers live on the connection.

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::cmd::Cmd;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::reply::Reply;
use crate::resp::{encode_command, read_reply};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Single TCP connection with reusable buffers.
pub struct Connection {
    id: u64,
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: BytesMut,
    broken: bool,
}

impl Connection {
    /// Opens a new connection using the address and timeouts in `config`.
    pub fn open(config: &ClientConfig) -> ClientResult<Self> {
        let stream = connect_stream(config)?;
        if let Some(timeout) = config.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        if let Some(timeout) = config.write_timeout {
            stream.set_write_timeout(Some(timeout))?;
        }
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(conn = id, addr = %config.addr, "connection established");

        Ok(Connection {
            id,
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: BytesMut::with_capacity(256),
            broken: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns true once a transport or protocol failure has been observed.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Sends one command and waits for its reply.
    ///
    /// Error replies from the store come back as `Reply::Error`; only
    /// transport and framing failures are `Err`.
    pub fn execute(&mut self, cmd: &Cmd) -> ClientResult<Reply> {
        self.ensure_usable()?;
        trace!(conn = self.id, command = %cmd, "execute");
        self.write_buf.clear();
        encode_command(cmd, &mut self.write_buf);
        let result = self.write_frame().and_then(|()| self.read_one());
        self.track(result)
    }

    /// Sends every command in one frame and reads the replies in order.
    ///
    /// The returned vector always has `cmds.len()` entries.
    pub fn execute_packed(&mut self, cmds: &[Cmd]) -> ClientResult<Vec<Reply>> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_usable()?;
        trace!(conn = self.id, commands = cmds.len(), "execute packed");

        self.write_buf.clear();
        for cmd in cmds {
            encode_command(cmd, &mut self.write_buf);
        }
        let result = self.write_frame().and_then(|()| {
            let mut replies = Vec::with_capacity(cmds.len());
            for _ in 0..cmds.len() {
                replies.push(self.read_one()?);
            }
            Ok(replies)
        });
        self.track(result)
    }

    /// Switches to batch mode: commands queue locally until `flush`.
    pub fn enter_batch_mode(&mut self) -> BatchHandle<'_> {
        BatchHandle {
            conn: self,
            queued: Vec::new(),
        }
    }

    /// Returns a handle that can shut this connection down from another thread.
    pub fn closer(&self) -> ClientResult<ConnectionCloser> {
        let stream = self.reader.get_ref().try_clone()?;
        Ok(ConnectionCloser { stream })
    }

    /// Writes a command without reading a reply.
    ///
    /// Used by subscription mode where replies arrive as pushes.
    pub(crate) fn send(&mut self, cmd: &Cmd) -> ClientResult<()> {
        self.ensure_usable()?;
        trace!(conn = self.id, command = %cmd, "send");
        self.write_buf.clear();
        encode_command(cmd, &mut self.write_buf);
        let result = self.write_frame();
        self.track(result)
    }

    /// Reads the next reply without sending anything.
    pub(crate) fn receive(&mut self) -> ClientResult<Reply> {
        self.ensure_usable()?;
        let result = self.read_one();
        self.track(result)
    }

    /// Reads the next push. A peer that hangs up between replies yields
    /// `Ok(None)`; a hang-up inside a reply is still an error.
    pub(crate) fn receive_push(&mut self) -> ClientResult<Option<Reply>> {
        self.ensure_usable()?;
        let at_eof = match self.reader.fill_buf() {
            Ok(buffered) => buffered.is_empty(),
            Err(err) => return self.track(Err(err.into())),
        };
        if at_eof {
            debug!(conn = self.id, "peer closed the connection");
            self.broken = true;
            return Ok(None);
        }
        let result = self.read_one();
        self.track(result).map(Some)
    }

    /// Clones the socket for a writer that lives on another thread.
    pub(crate) fn try_clone_stream(&self) -> ClientResult<TcpStream> {
        Ok(self.reader.get_ref().try_clone()?)
    }

    fn write_frame(&mut self) -> ClientResult<()> {
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        Ok(())
    }

    fn read_one(&mut self) -> ClientResult<Reply> {
        read_reply(&mut self.reader, &mut self.line_buf)
    }

    fn ensure_usable(&self) -> ClientResult<()> {
        if self.broken {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    fn track<T>(&mut self, result: ClientResult<T>) -> ClientResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                // Stream position is unknown after a failure; never reuse it.
                debug!(conn = self.id, error = %err, "connection marked broken");
                self.broken = true;
            }
        }
        result
    }
}

/// Batch mode on a borrowed connection.
///
/// `execute` only queues; `flush` sends the queue as one frame and returns
/// replies matched to submission order. The queue is empty after a flush,
/// whatever its outcome.
pub struct BatchHandle<'c> {
    conn: &'c mut Connection,
    queued: Vec<Cmd>,
}

impl<'c> BatchHandle<'c> {
    /// Queues a command and returns its position in the next flush.
    pub fn execute(&mut self, cmd: Cmd) -> usize {
        self.queued.push(cmd);
        self.queued.len() - 1
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Sends all queued commands and clears the queue.
    pub fn flush(&mut self) -> ClientResult<Vec<Reply>> {
        let queued = std::mem::take(&mut self.queued);
        self.conn.execute_packed(&queued)
    }
}

/// Shuts a connection down from another thread.
///
/// A caller blocked in `execute` on the same connection wakes up with a
/// `ClientError::Connection`.
#[derive(Debug)]
pub struct ConnectionCloser {
    stream: TcpStream,
}

impl ConnectionCloser {
    pub fn close(&self) -> ClientResult<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already closed by the peer.
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn connect_stream(config: &ClientConfig) -> ClientResult<TcpStream> {
    let addr = resolve(&config.addr)?;
    let stream = match config.connect_timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
        None => TcpStream::connect(addr)?,
    };
    Ok(stream)
}

fn resolve(addr: &str) -> ClientResult<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|_| ClientError::InvalidAddress(addr.to_string()))?
        .next()
        .ok_or_else(|| ClientError::InvalidAddress(addr.to_string()))
}
