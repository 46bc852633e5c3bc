//! Data Relay Module
//!
//! Per-connection relay sessions: two copy loops plus optional duplication tees.

pub mod session;
pub mod stats;

pub use session::{Session, DEFAULT_BUFFER_SIZE};
pub use stats::{SessionStats, StatsSnapshot};

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::Result;

/// Direction of a copy loop within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client -> target, mirrored to the output endpoint
    Upstream,
    /// target -> client, mirrored to the input endpoint
    Downstream,
}

impl Direction {
    /// Side the loop reads from
    pub fn source(self) -> &'static str {
        match self {
            Direction::Upstream => "local",
            Direction::Downstream => "remote",
        }
    }

    /// Side the loop writes to
    pub fn sink(self) -> &'static str {
        match self {
            Direction::Upstream => "remote",
            Direction::Downstream => "local",
        }
    }

    /// Name of the duplication endpoint fed by this loop
    pub fn tee(self) -> &'static str {
        match self {
            Direction::Upstream => "output",
            Direction::Downstream => "input",
        }
    }
}

/// Connect to `addr`, giving up after `limit` when one is set
pub async fn dial(addr: SocketAddr, limit: Option<Duration>) -> Result<TcpStream> {
    let stream = match limit {
        Some(limit) => timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("connection to {} timed out after {:?}", addr, limit))?,
        None => TcpStream::connect(addr).await,
    }
    .with_context(|| format!("failed to connect to {}", addr))?;

    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Resolve once `rx` reports closing, or once its sender is gone
pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closing| *closing).await;
}
