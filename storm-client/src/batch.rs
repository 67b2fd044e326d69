//! # Batch Executor
//!
//! Purpose: Let a caller compose N independent commands and pay for one
//! round trip.
//!
//! A batch is a throughput tool, not a concurrency primitive: other clients'
//! commands may interleave with it on the store. Use the transaction
//! coordinator when the commands must apply as one unit.

use tracing::trace;

use crate::cmd::Cmd;
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::reply::Reply;

/// Ordered commands waiting for submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    commands: Vec<Cmd>,
}

impl Batch {
    pub fn new() -> Self {
        Batch::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Batch {
            commands: Vec::with_capacity(capacity),
        }
    }

    /// Appends a command; its reply will sit at the same position.
    pub fn add(&mut self, cmd: Cmd) -> &mut Self {
        self.commands.push(cmd);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Cmd] {
        &self.commands
    }
}

impl FromIterator<Cmd> for Batch {
    fn from_iter<I: IntoIterator<Item = Cmd>>(iter: I) -> Self {
        Batch {
            commands: iter.into_iter().collect(),
        }
    }
}

impl Extend<Cmd> for Batch {
    fn extend<I: IntoIterator<Item = Cmd>>(&mut self, iter: I) {
        self.commands.extend(iter);
    }
}

/// Anything that can submit a batch in one round trip.
pub trait BatchExecutor {
    /// Submits the batch and returns exactly `batch.len()` replies in
    /// submission order. Error replies stay in their slot as `Reply::Error`.
    fn submit(&mut self, batch: Batch) -> ClientResult<Vec<Reply>>;
}

impl BatchExecutor for Connection {
    fn submit(&mut self, batch: Batch) -> ClientResult<Vec<Reply>> {
        let expected = batch.len();
        trace!(conn = self.id(), commands = expected, "submitting batch");

        let mut handle = self.enter_batch_mode();
        for cmd in batch.commands {
            handle.execute(cmd);
        }
        let replies = handle.flush()?;

        if replies.len() != expected {
            return Err(ClientError::Protocol(format!(
                "batch of {} commands produced {} replies",
                expected,
                replies.len()
            )));
        }
        Ok(replies)
    }
}
