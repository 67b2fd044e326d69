//! # storm-testkit
//!
//! Purpose: An in-memory, Redis-compatible RESP2 server for integration
//! tests. It runs on its own tokio runtime thread so blocking clients can
//! talk to it from ordinary `#[test]` functions.
//!
//! ## Design Principles
//! 1. **Real Sockets**: Tests exercise the client's actual TCP path.
//! 2. **Single Keyspace Lock**: Commands, `EXEC` bodies and scripts run under
//!    one mutex, so transactions and scripts are atomic.
//! 3. **Scripts as Closures**: There is no script interpreter; a test
//!    registers the Rust handler that stands in for a script source.
//!
//! ## Usage
//!
//! ```no_run
//! let server = storm_testkit::TestServer::start().unwrap();
//! let addr = server.addr_string();
//! // point a client at `addr`
//! ```

mod commands;
mod keyspace;
mod protocol;
mod pubsub;
mod scripting;
mod server;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

pub use keyspace::{Keyspace, StoreError};
pub use protocol::{RespError, RespParser, Value};
pub use pubsub::glob_match;
pub use scripting::{digest, ScriptContext, ScriptHandler};

use server::Shared;

/// Running test server. Dropping it stops the server and closes every
/// client connection.
pub struct TestServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Binds an ephemeral port on 127.0.0.1 and starts serving.
    pub fn start() -> io::Result<Self> {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        std_listener.set_nonblocking(true)?;
        let addr = std_listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("storm-testkit-worker")
            .enable_all()
            .build()?;

        let shared = Arc::new(Shared::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("storm-testkit".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match TcpListener::from_std(std_listener) {
                        Ok(listener) => listener,
                        Err(err) => {
                            warn!(error = %err, "failed to register listener");
                            return;
                        }
                    };
                    server::accept_loop(listener, thread_shared, shutdown_rx).await;
                });
                // Dropping the runtime cancels every connection task.
            })?;

        info!(%addr, "test server listening");
        Ok(TestServer {
            addr,
            shared,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address in `host:port` form, as client configs expect it.
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    /// Registers the handler that runs whenever `source` is evaluated.
    pub fn register_script<F>(&self, source: &str, handler: F)
    where
        F: Fn(&mut ScriptContext<'_>) -> Value + Send + Sync + 'static,
    {
        self.shared.scripts().register(source, Arc::new(handler));
    }

    /// Forgets every loaded script digest, like `SCRIPT FLUSH`.
    pub fn flush_scripts(&self) {
        self.shared.scripts().flush();
    }

    /// Runs `f` with the keyspace locked, bypassing the network.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut Keyspace) -> R) -> R {
        f(&mut self.shared.store())
    }

    /// Stops accepting and waits for the server thread to finish.
    pub fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("test server thread panicked");
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
