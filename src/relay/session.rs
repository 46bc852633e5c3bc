//! Relay Session
//!
//! One accepted client connection paired with its target connection, plus at
//! most one duplication connection per direction.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn};

use super::{dial, wait_closed, Direction, SessionStats};
use crate::address::{resolve, Endpoint};
use crate::Result;

/// Size of the per-direction copy buffer unless configured otherwise
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy)]
enum Slot {
    Local,
    Remote,
    Input,
    Output,
}

impl From<Direction> for Slot {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Upstream => Slot::Output,
            Direction::Downstream => Slot::Input,
        }
    }
}

/// Connection handles held by a session until `run` takes them
#[derive(Debug, Default)]
struct Connections {
    local: Option<TcpStream>,
    remote: Option<TcpStream>,
    input: Option<TcpStream>,
    output: Option<TcpStream>,
}

impl Connections {
    fn slot(&mut self, slot: Slot) -> &mut Option<TcpStream> {
        match slot {
            Slot::Local => &mut self.local,
            Slot::Remote => &mut self.remote,
            Slot::Input => &mut self.input,
            Slot::Output => &mut self.output,
        }
    }

    fn clear(&mut self) {
        self.local = None;
        self.remote = None;
        self.input = None;
        self.output = None;
    }
}

/// Relay state for a single client connection
pub struct Session {
    name: String,
    buffer_size: usize,
    connect_timeout: Option<Duration>,
    conns: Mutex<Connections>,
    closing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicUsize,
    stats: SessionStats,
}

impl Session {
    /// Create a session for an accepted connection.
    ///
    /// `name` tags every log line, usually the peer address.
    pub fn new(name: impl Into<String>, conn: TcpStream) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: None,
            conns: Mutex::new(Connections {
                local: Some(conn),
                ..Default::default()
            }),
            closing: AtomicBool::new(false),
            shutdown_tx,
            running: AtomicUsize::new(0),
            stats: SessionStats::new(),
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Bound every dial made by this session; `None` waits for the OS
    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Number of copy loops still running (0, 1 or 2)
    pub fn running_tasks(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Dial the target. Failure is logged and returned; the caller abandons the session.
    pub async fn set_remote(&self, endpoint: &Endpoint) -> Result<()> {
        match dial(endpoint.to_socket_addr(), self.connect_timeout).await {
            Ok(conn) => self.attach(Slot::Remote, conn),
            Err(e) => {
                warn!("[{}] remote connect error: {:#}", self.name, e);
                Err(e)
            }
        }
    }

    /// Mirror target -> client traffic to `address`
    pub async fn set_input(&self, address: &str) -> Result<()> {
        self.set_tee(Direction::Downstream, address).await
    }

    /// Mirror client -> target traffic to `address`
    pub async fn set_output(&self, address: &str) -> Result<()> {
        self.set_tee(Direction::Upstream, address).await
    }

    // An empty or unresolvable address leaves the tee off and is not an error.
    // A resolvable address that cannot be dialed is.
    async fn set_tee(&self, direction: Direction, address: &str) -> Result<()> {
        self.conns().slot(direction.into()).take();
        if address.is_empty() {
            return Ok(());
        }

        let Some(endpoint) = resolve(address).await else {
            debug!(
                "[{}] {} address {:?} does not resolve, duplication skipped",
                self.name,
                direction.tee(),
                address
            );
            return Ok(());
        };

        match dial(endpoint.to_socket_addr(), self.connect_timeout).await {
            Ok(conn) => self.attach(direction.into(), conn),
            Err(e) => {
                warn!("[{}] {} connect error: {:#}", self.name, direction.tee(), e);
                warn!("[{}] disable {}", self.name, direction.tee());
                Err(e)
            }
        }
    }

    fn attach(&self, slot: Slot, conn: TcpStream) -> Result<()> {
        let mut conns = self.conns();
        if self.is_closing() {
            bail!("[{}] session is closed", self.name);
        }
        *conns.slot(slot) = Some(conn);
        Ok(())
    }

    fn conns(&self) -> MutexGuard<'_, Connections> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close every held connection and wake both copy loops. Idempotent.
    pub fn close(&self) {
        let mut conns = self.conns();
        if !self.closing.swap(true, Ordering::AcqRel) {
            debug!("[{}] closing session", self.name);
        }
        self.shutdown_tx.send_replace(true);
        conns.clear();
    }

    /// Relay in both directions until either side fails, then tear down.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (local, remote, input, output) = {
            let mut conns = self.conns();
            if self.is_closing() {
                bail!("[{}] session is closed", self.name);
            }
            if conns.remote.is_none() {
                bail!("[{}] session has no remote connection", self.name);
            }
            let local = conns
                .local
                .take()
                .ok_or_else(|| anyhow!("[{}] session has no local connection", self.name))?;
            let remote = conns
                .remote
                .take()
                .ok_or_else(|| anyhow!("[{}] session has no remote connection", self.name))?;
            (local, remote, conns.input.take(), conns.output.take())
        };

        info!("[{}] session started", self.name);

        let mut drains = Vec::new();
        let output = output.map(|conn| self.split_tee(Direction::Upstream, conn, &mut drains));
        let input = input.map(|conn| self.split_tee(Direction::Downstream, conn, &mut drains));
        let (local_rx, local_tx) = local.into_split();
        let (remote_rx, remote_tx) = remote.into_split();

        self.running.fetch_add(2, Ordering::AcqRel);
        let upstream = tokio::spawn(
            Arc::clone(&self)
                .forward(Direction::Upstream, local_rx, remote_tx, output)
                .with_current_subscriber(),
        );
        let downstream = tokio::spawn(
            Arc::clone(&self)
                .forward(Direction::Downstream, remote_rx, local_tx, input)
                .with_current_subscriber(),
        );

        let (up, down) = tokio::join!(upstream, downstream);
        for result in [up, down] {
            if let Err(e) = result {
                error!("[{}] copy task failed: {}", self.name, e);
            }
        }
        // Covers a copy task that panicked before reaching its own close
        self.close();

        for drain in drains {
            let _ = drain.await;
        }

        self.stats.log(&self.name);
        info!("[{}] session closed", self.name);
        Ok(())
    }

    fn split_tee(
        self: &Arc<Self>,
        direction: Direction,
        conn: TcpStream,
        drains: &mut Vec<JoinHandle<()>>,
    ) -> OwnedWriteHalf {
        let (rx, tx) = conn.into_split();
        drains.push(tokio::spawn(
            Arc::clone(self)
                .blackhole(direction, rx)
                .with_current_subscriber(),
        ));
        tx
    }

    async fn forward(
        self: Arc<Self>,
        direction: Direction,
        mut src: OwnedReadHalf,
        mut dst: OwnedWriteHalf,
        mut tee: Option<OwnedWriteHalf>,
    ) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut buf = vec![0u8; self.buffer_size];

        while !self.is_closing() {
            let n = tokio::select! {
                biased;
                _ = wait_closed(&mut shutdown) => break,
                read = src.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("[{}] {} read EOF", self.name, direction.source());
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("[{}] {} read error: {}", self.name, direction.source(), e);
                        break;
                    }
                },
            };
            let chunk = &buf[..n];

            let written = tokio::select! {
                biased;
                _ = wait_closed(&mut shutdown) => break,
                written = dst.write_all(chunk) => written,
            };
            if let Err(e) = written {
                warn!("[{}] {} write error: {}", self.name, direction.sink(), e);
                break;
            }
            self.stats.add_relayed(direction, n);

            let mirrored = match tee.as_mut() {
                Some(writer) => tokio::select! {
                    biased;
                    _ = wait_closed(&mut shutdown) => break,
                    mirrored = writer.write_all(chunk) => Some(mirrored),
                },
                None => None,
            };
            match mirrored {
                Some(Ok(())) => self.stats.add_mirrored(direction, n),
                Some(Err(e)) => {
                    warn!("[{}] {} write error: {}", self.name, direction.tee(), e);
                    warn!("[{}] disable {}", self.name, direction.tee());
                    tee = None;
                }
                None => {}
            }
        }

        self.running.fetch_sub(1, Ordering::AcqRel);
        self.close();
    }

    /// Read and discard whatever a duplication endpoint sends back
    async fn blackhole(self: Arc<Self>, direction: Direction, mut conn: OwnedReadHalf) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut buf = vec![0u8; self.buffer_size];

        while !self.is_closing() {
            tokio::select! {
                biased;
                _ = wait_closed(&mut shutdown) => break,
                read = conn.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("[{}] {} endpoint closed its side", self.name, direction.tee());
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("[{}] {} drain error: {}", self.name, direction.tee(), e);
                        break;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_client, accepted) = connected_pair().await;
        let session = Session::new("test", accepted);

        assert!(!session.is_closing());
        session.close();
        session.close();
        assert!(session.is_closing());
        assert!(session.conns().local.is_none());
    }

    #[tokio::test]
    async fn test_run_without_remote_fails() {
        let (_client, accepted) = connected_pair().await;
        let session = Arc::new(Session::new("test", accepted));

        assert!(Arc::clone(&session).run().await.is_err());
        assert_eq!(session.running_tasks(), 0);
    }

    #[tokio::test]
    async fn test_empty_and_unresolvable_tee_are_skipped() {
        let (_client, accepted) = connected_pair().await;
        let session = Session::new("test", accepted);

        assert!(session.set_input("").await.is_ok());
        assert!(session.set_output("not an address").await.is_ok());
        assert!(session.conns().input.is_none());
        assert!(session.conns().output.is_none());
    }

    #[tokio::test]
    async fn test_attach_after_close_is_rejected() {
        let (_client, accepted) = connected_pair().await;
        let (_peer, spare) = connected_pair().await;
        let session = Session::new("test", accepted);

        session.close();
        assert!(session.attach(Slot::Remote, spare).is_err());
        assert!(session.conns().remote.is_none());
    }
}
