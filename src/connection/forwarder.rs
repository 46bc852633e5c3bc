//! TCP Forwarder
//!
//! Owns the listening socket and the accept loop. Every accepted connection
//! gets its own [`Session`] which runs independently of the forwarder.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn, Dispatch};

use crate::address::Endpoint;
use crate::relay::{wait_closed, Session, DEFAULT_BUFFER_SIZE};
use crate::Result;

/// Lifecycle of a forwarder's listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ForwarderState {
    Running = 0,
    Closing = 1,
    Closed = 2,
}

impl ForwarderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ForwarderState::Running,
            1 => ForwarderState::Closing,
            _ => ForwarderState::Closed,
        }
    }
}

/// Settings applied to every session spawned by one `open`
#[derive(Debug, Clone)]
struct SessionSettings {
    input: String,
    output: String,
    buffer_size: usize,
    connect_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            input: String::new(),
            output: String::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: None,
        }
    }
}

/// State guarded by the open/close lock
#[derive(Default)]
struct Listener {
    source: Option<Endpoint>,
    dest: Option<Endpoint>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

/// Shared with the accept loop and its sessions
struct AcceptContext {
    dest: Endpoint,
    settings: SessionSettings,
    state: Arc<AtomicU8>,
    active_sessions: Arc<AtomicUsize>,
}

/// Decrements the accept-task count when the loop exits, however it exits
struct AcceptGuard(Arc<watch::Sender<usize>>);

impl Drop for AcceptGuard {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Tracks one in-flight session
struct ActiveSession(Arc<AtomicUsize>);

impl ActiveSession {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Accepts connections on one address and relays each to a fixed target
pub struct Forwarder {
    listener: Mutex<Listener>,
    state: Arc<AtomicU8>,
    accept_tasks: Arc<watch::Sender<usize>>,
    active_sessions: Arc<AtomicUsize>,
    settings: SessionSettings,
    dispatch: Option<Dispatch>,
}

impl Forwarder {
    /// Create a closed forwarder
    pub fn new() -> Self {
        let (accept_tasks, _) = watch::channel(0);
        Self {
            listener: Mutex::new(Listener::default()),
            state: Arc::new(AtomicU8::new(ForwarderState::Closed as u8)),
            accept_tasks: Arc::new(accept_tasks),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            settings: SessionSettings::default(),
            dispatch: None,
        }
    }

    /// Route every event from the accept loop and its sessions to `dispatch`.
    ///
    /// Without one, spawned tasks log to whatever dispatcher is current when
    /// `open` is called.
    pub fn set_logger(&mut self, dispatch: Dispatch) {
        self.dispatch = Some(dispatch);
    }

    /// Duplication address for target -> client traffic; empty disables it
    pub fn set_input_dup(&mut self, address: impl Into<String>) {
        self.settings.input = address.into();
    }

    /// Duplication address for client -> target traffic; empty disables it
    pub fn set_output_dup(&mut self, address: impl Into<String>) {
        self.settings.output = address.into();
    }

    pub fn set_buffer_size(&mut self, buffer_size: usize) {
        self.settings.buffer_size = buffer_size.max(1);
    }

    pub fn set_connect_timeout(&mut self, connect_timeout: Option<Duration>) {
        self.settings.connect_timeout = connect_timeout;
    }

    pub fn state(&self) -> ForwarderState {
        ForwarderState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sessions spawned by this forwarder that have not finished yet
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    /// Address the listener is bound to, if open
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.local_addr
    }

    /// Source endpoint of the last `open`
    pub async fn source(&self) -> Option<Endpoint> {
        self.listener.lock().await.source.clone()
    }

    /// Target endpoint of the last `open`
    pub async fn target(&self) -> Option<Endpoint> {
        self.listener.lock().await.dest.clone()
    }

    /// Bind `source` and relay every accepted connection to `dest`.
    ///
    /// Any previous listener is shut down first. Returns once the accept loop
    /// is running.
    pub async fn open(&self, source: &Endpoint, dest: &Endpoint) -> Result<()> {
        let mut listener = self.listener.lock().await;
        self.shutdown(&mut listener).await;

        listener.source = Some(source.clone());
        listener.dest = Some(dest.clone());

        let bind_addr = source.to_socket_addr();
        info!("Binding TCP listener to {}", bind_addr);
        let socket = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind listener to {}", bind_addr))?;
        listener.local_addr = socket.local_addr().ok();
        self.state.store(ForwarderState::Running as u8, Ordering::Release);

        let context = Arc::new(AcceptContext {
            dest: dest.clone(),
            settings: self.settings.clone(),
            state: Arc::clone(&self.state),
            active_sessions: Arc::clone(&self.active_sessions),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        self.accept_tasks.send_modify(|count| *count += 1);
        let guard = AcceptGuard(Arc::clone(&self.accept_tasks));

        let dispatch = match &self.dispatch {
            Some(dispatch) => dispatch.clone(),
            None => tracing::dispatcher::get_default(Dispatch::clone),
        };
        let task = tokio::spawn(
            accept_loop(socket, context, shutdown_rx, ready_tx, guard).with_subscriber(dispatch),
        );
        listener.shutdown_tx = Some(shutdown_tx);
        listener.accept_task = Some(task);

        ready_rx
            .await
            .map_err(|_| anyhow!("accept loop exited before it started"))?;

        info!(
            "Forwarding {} -> {} (input: {:?}, output: {:?})",
            listener.local_addr.map(Endpoint::from).unwrap_or_else(|| source.clone()),
            dest,
            self.settings.input,
            self.settings.output
        );
        Ok(())
    }

    /// Stop accepting and wait for the accept loop to exit.
    ///
    /// Sessions already spawned keep running until their own I/O ends.
    pub async fn close(&self) {
        let mut listener = self.listener.lock().await;
        self.shutdown(&mut listener).await;
    }

    async fn shutdown(&self, listener: &mut Listener) {
        if let Some(shutdown_tx) = listener.shutdown_tx.take() {
            self.state.store(ForwarderState::Closing as u8, Ordering::Release);
            shutdown_tx.send_replace(true);
        }
        if let Some(task) = listener.accept_task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Accept loop failed: {}", e);
                }
            }
            info!("Listener closed");
        }
        listener.local_addr = None;
        self.state.store(ForwarderState::Closed as u8, Ordering::Release);
    }

    /// Block until the accept loop has exited
    pub async fn wait(&self) {
        let mut accept_tasks = self.accept_tasks.subscribe();
        let _ = accept_tasks.wait_for(|count| *count == 0).await;
    }

    /// Wait up to `timeout` for in-flight sessions to finish
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let start_time = Instant::now();
        info!(
            "Waiting for {} active sessions to close (timeout: {:?})",
            self.active_sessions(),
            timeout
        );

        while self.active_sessions() > 0 && start_time.elapsed() < timeout {
            debug!("Waiting for {} active sessions to close", self.active_sessions());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.active_sessions();
        let elapsed = start_time.elapsed();
        if remaining == 0 {
            info!("All sessions closed in {:?}", elapsed);
        } else {
            warn!(
                "Drain timeout reached after {:?} with {} sessions still active",
                elapsed, remaining
            );
        }
        Ok(())
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<AcceptContext>,
    mut shutdown_rx: watch::Receiver<bool>,
    ready: oneshot::Sender<()>,
    _guard: AcceptGuard,
) {
    let _ = ready.send(());
    debug!("Starting connection acceptance loop");

    while ForwarderState::from_u8(context.state.load(Ordering::Acquire)) == ForwarderState::Running {
        tokio::select! {
            biased;
            _ = wait_closed(&mut shutdown_rx) => {
                debug!("Shutdown signal received, stopping connection acceptance");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    spawn_session(Arc::clone(&context), stream, peer);
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    break;
                }
            },
        }
    }

    // Stopped on its own, not through close
    let _ = context.state.compare_exchange(
        ForwarderState::Running as u8,
        ForwarderState::Closed as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    debug!("Connection acceptance loop stopped");
}

/// Count the session before its task exists, so `drain` never misses it
fn spawn_session(
    context: Arc<AcceptContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> JoinHandle<()> {
    let active = ActiveSession::enter(&context.active_sessions);
    tokio::spawn(handle_connection(context, stream, peer, active).with_current_subscriber())
}

async fn handle_connection(
    context: Arc<AcceptContext>,
    stream: TcpStream,
    peer: SocketAddr,
    _active: ActiveSession,
) {
    stream.set_nodelay(true).ok();

    let settings = &context.settings;
    let session = Arc::new(
        Session::new(peer.to_string(), stream)
            .with_buffer_size(settings.buffer_size)
            .with_connect_timeout(settings.connect_timeout),
    );

    if session.set_remote(&context.dest).await.is_err() {
        session.close();
        return;
    }
    if session.set_input(&settings.input).await.is_err()
        || session.set_output(&settings.output).await.is_err()
    {
        session.close();
        return;
    }

    if let Err(e) = session.run().await {
        warn!("[{}] session aborted: {:#}", peer, e);
    }
}
