//! # Optimistic Transactions
//!
//! Purpose: Run a caller-supplied critical section so that its writes apply
//! only if nothing touched the watched keys since they were read, retrying
//! on conflict instead of locking.
//!
//! ## Design Principles
//! 1. **Explicit State Machine**: Every session call checks the current
//!    `TxState`; out-of-order calls fail locally with `InvalidState`.
//! 2. **Client-Side Staging**: Staged commands are buffered and flushed with
//!    `MULTI`/`EXEC` in one frame, so a conflict never leaves half a queue on
//!    the server.
//! 3. **Outcomes over Errors**: A failed precondition is `TxOutcome::Aborted`;
//!    a conflict is retried; only an exhausted retry bound is an error.
//! 4. **Release on Drop**: A session that ends early unwatches its keys.
//!
//! ## Attempt Lifecycle
//!
//! ```text
//! Idle ──watch──▶ Watching ──read──▶ Reading ──abort──▶ Aborted
//!                     │                 │
//!                     └──────multi──────┴──▶ Staging ──commit──▶ Committing
//!                                                                 │
//!                                              Committed ◀────────┴────────▶ Conflict
//! ```

use std::fmt;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::cmd::{Cmd, ToArg};
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::reply::{FromReply, Reply};

/// State of one transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    Watching,
    Reading,
    Staging,
    Committing,
    Committed,
    Conflict,
    Aborted,
}

impl TxState {
    /// Terminal states end the attempt; the store holds no watch for them.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::Conflict | TxState::Aborted)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxState::Idle => "IDLE",
            TxState::Watching => "WATCHING",
            TxState::Reading => "READING",
            TxState::Staging => "STAGING",
            TxState::Committing => "COMMITTING",
            TxState::Committed => "COMMITTED",
            TxState::Conflict => "CONFLICT",
            TxState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Result of flushing a staged transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitResult {
    /// Every staged command applied; replies are in staging order.
    Committed(Vec<Reply>),
    /// A watched key changed; nothing was applied.
    Conflict,
}

/// One attempt of an optimistic transaction on a borrowed connection.
///
/// Owned by a single caller for the whole attempt. Dropping it before a
/// terminal state sends `UNWATCH`.
pub struct TransactionSession<'c> {
    conn: &'c mut Connection,
    watched: Vec<Bytes>,
    staged: Vec<Cmd>,
    state: TxState,
}

impl<'c> TransactionSession<'c> {
    pub fn new(conn: &'c mut Connection) -> Self {
        TransactionSession {
            conn,
            watched: Vec::new(),
            staged: Vec::new(),
            state: TxState::Idle,
        }
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn watched_keys(&self) -> &[Bytes] {
        &self.watched
    }

    pub fn staged(&self) -> &[Cmd] {
        &self.staged
    }

    /// Registers keys with the store's conflict detection.
    ///
    /// May be called again before staging to widen the watch set.
    pub fn watch<K: ToArg>(&mut self, keys: &[K]) -> ClientResult<()> {
        self.expect_state(
            &[TxState::Idle, TxState::Watching, TxState::Reading],
            "IDLE, WATCHING or READING",
        )?;
        if keys.is_empty() {
            return Ok(());
        }

        let cmd = Cmd::watch(keys);
        let reply = self.conn.execute(&cmd)?;
        if let Reply::Error(err) = reply {
            return Err(ClientError::Server(err));
        }

        self.watched.extend(keys.iter().map(|key| key.to_arg()));
        if self.state == TxState::Idle {
            self.state = TxState::Watching;
        }
        trace!(conn = self.conn.id(), keys = self.watched.len(), "watching");
        Ok(())
    }

    /// Executes a read while the watch is held.
    pub fn read<T: FromReply>(&mut self, cmd: &Cmd) -> ClientResult<T> {
        self.expect_state(&[TxState::Watching, TxState::Reading], "WATCHING or READING")?;
        self.state = TxState::Reading;
        let reply = self.conn.execute(cmd)?;
        T::from_reply(reply)
    }

    /// Gives up the attempt because a precondition failed.
    pub fn abort(&mut self) -> ClientResult<()> {
        self.expect_state(
            &[TxState::Idle, TxState::Watching, TxState::Reading],
            "IDLE, WATCHING or READING",
        )?;
        self.staged.clear();
        if !self.watched.is_empty() {
            self.conn.execute(&Cmd::unwatch())?;
        }
        self.state = TxState::Aborted;
        Ok(())
    }

    /// Enters the elevated mode in which writes are staged.
    pub fn multi(&mut self) -> ClientResult<()> {
        self.expect_state(
            &[TxState::Idle, TxState::Watching, TxState::Reading],
            "IDLE, WATCHING or READING",
        )?;
        self.state = TxState::Staging;
        Ok(())
    }

    /// Buffers a command for the commit frame.
    pub fn queue(&mut self, cmd: Cmd) -> ClientResult<()> {
        self.expect_state(&[TxState::Staging], "STAGING")?;
        self.staged.push(cmd);
        Ok(())
    }

    /// Flushes `MULTI`, the staged commands and `EXEC` as one frame.
    ///
    /// A null `EXEC` reply means a watched key changed and nothing applied.
    /// An `EXEC` error (for instance `EXECABORT` after a rejected queued
    /// command) ends the attempt as aborted and surfaces as
    /// `ClientError::Server`.
    pub fn commit(&mut self) -> ClientResult<CommitResult> {
        self.expect_state(&[TxState::Staging], "STAGING")?;
        self.state = TxState::Committing;

        let staged = std::mem::take(&mut self.staged);
        let mut frame = Vec::with_capacity(staged.len() + 2);
        frame.push(Cmd::multi());
        frame.extend(staged);
        frame.push(Cmd::exec());

        let mut replies = self.conn.execute_packed(&frame)?;
        let exec_reply = replies.pop().unwrap_or(Reply::Nil);

        // MULTI and every queued command must have been accepted.
        let rejected = replies.into_iter().find_map(|reply| match reply {
            Reply::Error(err) => Some(err),
            _ => None,
        });

        match exec_reply {
            Reply::Array(results) => {
                self.state = TxState::Committed;
                Ok(CommitResult::Committed(results))
            }
            Reply::Nil => {
                self.state = TxState::Conflict;
                Ok(CommitResult::Conflict)
            }
            Reply::Error(err) => {
                self.state = TxState::Aborted;
                Err(ClientError::Server(rejected.unwrap_or(err)))
            }
            other => {
                self.state = TxState::Aborted;
                Err(ClientError::UnexpectedResponse {
                    expected: "EXEC array or nil",
                    found: other.kind_name(),
                })
            }
        }
    }

    fn expect_state(&self, allowed: &[TxState], expected: &'static str) -> ClientResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ClientError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }
}

impl Drop for TransactionSession<'_> {
    fn drop(&mut self) {
        if self.state.is_terminal() || self.watched.is_empty() || self.conn.is_broken() {
            return;
        }
        // Best effort: a failure here already marked the connection broken.
        if let Err(err) = self.conn.execute(&Cmd::unwatch()) {
            debug!(conn = self.conn.id(), error = %err, "unwatch on drop failed");
        }
    }
}

/// Read-only view handed to the critical section.
///
/// It can read under the watch but cannot stage or commit; the coordinator
/// does that with the returned `Plan`.
pub struct ReadPhase<'s, 'c> {
    session: &'s mut TransactionSession<'c>,
    attempt: u32,
}

impl<'s, 'c> ReadPhase<'s, 'c> {
    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn watched_keys(&self) -> &[Bytes] {
        self.session.watched_keys()
    }

    pub fn read<T: FromReply>(&mut self, cmd: &Cmd) -> ClientResult<T> {
        self.session.read(cmd)
    }

    /// Shorthand for `GET`.
    pub fn get<T: FromReply, K: ToArg>(&mut self, key: K) -> ClientResult<T> {
        self.session.read(&Cmd::get(key))
    }
}

/// What the critical section decided after reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan<A> {
    /// Apply these commands atomically if nothing changed.
    Commit(Vec<Cmd>),
    /// The precondition does not hold; stop without retrying.
    Abort(A),
}

/// Final outcome of a coordinated transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOutcome<A> {
    Committed { replies: Vec<Reply>, attempts: u32 },
    Aborted { reason: A, attempts: u32 },
}

impl<A> TxOutcome<A> {
    pub fn is_committed(&self) -> bool {
        matches!(self, TxOutcome::Committed { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            TxOutcome::Committed { attempts, .. } | TxOutcome::Aborted { attempts, .. } => *attempts,
        }
    }
}

/// How long the coordinator keeps retrying conflicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries until the transaction commits.
    pub max_attempts: Option<u32>,
    /// Optional pause between conflicting attempts.
    pub backoff: Option<Duration>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        RetryPolicy::default()
    }

    pub fn bounded(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: Some(max_attempts.max(1)),
            backoff: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    fn exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempts >= max)
    }
}

/// Drives watch → read → validate → commit → retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionCoordinator {
    policy: RetryPolicy,
}

impl TransactionCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        TransactionCoordinator { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Runs `critical` until its plan commits, it aborts, or the retry bound
    /// is exhausted.
    ///
    /// `critical` may run several times; it must derive its plan only from
    /// what it reads through the `ReadPhase`. Transport failures are returned
    /// immediately and never retried here.
    pub fn run<K, A, F>(
        &self,
        conn: &mut Connection,
        keys: &[K],
        mut critical: F,
    ) -> ClientResult<TxOutcome<A>>
    where
        K: ToArg,
        F: FnMut(&mut ReadPhase<'_, '_>) -> ClientResult<Plan<A>>,
    {
        if keys.is_empty() {
            return Err(ClientError::InvalidArgument(
                "a transaction needs at least one watched key".into(),
            ));
        }

        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            let mut session = TransactionSession::new(&mut *conn);
            session.watch(keys)?;

            let plan = {
                let mut phase = ReadPhase {
                    session: &mut session,
                    attempt: attempts,
                };
                critical(&mut phase)?
            };

            let cmds = match plan {
                Plan::Abort(reason) => {
                    session.abort()?;
                    debug!(attempts, "transaction aborted by precondition");
                    return Ok(TxOutcome::Aborted { reason, attempts });
                }
                Plan::Commit(cmds) => cmds,
            };

            session.multi()?;
            for cmd in cmds {
                session.queue(cmd)?;
            }

            match session.commit()? {
                CommitResult::Committed(replies) => {
                    debug!(attempts, "transaction committed");
                    return Ok(TxOutcome::Committed { replies, attempts });
                }
                CommitResult::Conflict => {
                    if self.policy.exhausted(attempts) {
                        warn!(attempts, "transaction conflict bound reached");
                        return Err(ClientError::TransactionConflictExceeded { attempts });
                    }
                    debug!(attempts, "watched key changed, retrying");
                    if let Some(backoff) = self.policy.backoff {
                        thread::sleep(backoff);
                    }
                }
            }
        }
    }
}
