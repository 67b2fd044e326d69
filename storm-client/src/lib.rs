//! # CacheStorm Sync Client
//!
//! Purpose: Provide a blocking, Redis-compatible client whose interesting
//! parts are not single commands but the patterns layered on top of them:
//! one-round-trip batches, watch-based optimistic transactions, and a
//! subscription listener that runs beside normal request traffic.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling and protocol details.
//! 2. **Explicit State Machines**: Transactions move through typed states;
//!    illegal transitions are rejected before any byte hits the wire.
//! 3. **Typed Outcomes**: Expected results such as a failed precondition or a
//!    script-reported failure are values, not errors.
//! 4. **One Connection, One Caller**: A `Connection` is driven by a single
//!    thread at a time; concurrency means more connections.
//!
//! ## Layering
//!
//! ```text
//! KVClient
//!   ├── ConnectionPool ── Connection ── resp (encode / decode)
//!   ├── BatchExecutor     (one frame, positional replies)
//!   ├── TransactionCoordinator ── TransactionSession
//!   ├── Subscription      (dedicated connection + listener thread)
//!   └── Script / ScriptInvocation
//! ```

mod batch;
mod client;
mod cmd;
mod config;
mod connection;
mod error;
mod pool;
mod pubsub;
mod reply;
mod resp;
mod script;
mod transaction;

pub use batch::{Batch, BatchExecutor};
pub use client::{ClientTtl, KVClient};
pub use cmd::{Cmd, ToArg};
pub use config::ClientConfig;
pub use connection::{BatchHandle, Connection, ConnectionCloser};
pub use error::{ClientError, ClientResult, ServerError};
pub use pool::{ConnectionPool, PooledConnection};
pub use pubsub::{ListenControl, Message, Subscription};
pub use reply::{FromReply, Reply};
pub use script::{Script, ScriptFailure, ScriptInvocation, ScriptResult};
pub use transaction::{
    CommitResult, Plan, ReadPhase, RetryPolicy, TransactionCoordinator, TransactionSession,
    TxOutcome, TxState,
};
