//! Runs the walkthrough against a live store.
//!
//! The address comes from `STORM_ADDR` (or the first argument), the rest of
//! the client settings from the other `STORM_*` variables.

use std::env;
use std::io;

use anyhow::{Context, Result};
use storm_client::{ClientConfig, KVClient};
use tracing::info;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();

    let mut config = ClientConfig::from_env().context("load client config")?;
    if let Some(addr) = env::args().nth(1) {
        config.addr = addr;
    }
    info!(addr = %config.addr, "connecting");

    let client = KVClient::with_config(config).context("connect")?;
    let pong = client.ping()?;
    info!(reply = %pong, "store reachable");

    let stdout = io::stdout();
    let mut out = stdout.lock();
    storm_demo::run_walkthrough(&client, &mut out)
}
