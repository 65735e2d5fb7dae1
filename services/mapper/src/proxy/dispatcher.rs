//! Accept dispatcher.
//!
//! One task waits for accept readiness on every listener at once. Each
//! accepted connection is paired with its listener's rule and submitted to the
//! [`WorkerPool`] as a [`ConnectionRelay`]. When the pool is full the
//! connection is closed instead of queued.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use portmap_rules::ProxyRule;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

use super::listener::ListenerSet;
use super::pool::{default_pool_size, WorkerPool};
use super::relay::{ConnectionRelay, RelayConfig, RelayOutcome, Termination};
use crate::error::DispatchError;

/// Pause before accepting again after the process ran out of sockets or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Settings for the dispatcher and the relays it starts.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of concurrent relays.
    pub pool_size: usize,
    /// Settings passed to every relay.
    pub relay: RelayConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            relay: RelayConfig::default(),
        }
    }
}

/// Counters for the dispatcher and its relays.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Connections accepted from the OS.
    pub connections_accepted: AtomicU64,
    /// Accepted connections closed because the pool rejected them.
    pub connections_rejected: AtomicU64,
    /// Relays that ended on end of stream.
    pub relays_completed: AtomicU64,
    /// Relays that ended on a connect failure or an I/O error.
    pub relays_failed: AtomicU64,
    /// Bytes copied from clients to remotes.
    pub bytes_to_remote: AtomicU64,
    /// Bytes copied from remotes to clients.
    pub bytes_to_client: AtomicU64,
}

impl DispatchStats {
    fn record(&self, outcome: &RelayOutcome) {
        match outcome.termination {
            Termination::Graceful { .. } => {
                self.relays_completed.fetch_add(1, Ordering::Relaxed);
            }
            Termination::ConnectFailed(_) | Termination::Forced { .. } => {
                self.relays_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.bytes_to_remote
            .fetch_add(outcome.bytes_to_remote, Ordering::Relaxed);
        self.bytes_to_client
            .fetch_add(outcome.bytes_to_client, Ordering::Relaxed);
    }
}

/// Requests a running dispatcher to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Ask the dispatcher to stop. Calling this more than once is harmless.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// A connection that became ready on one of the listeners.
struct ReadyAccept {
    rule: Arc<ProxyRule>,
    result: io::Result<(TcpStream, SocketAddr)>,
}

/// Accept loop over all listeners.
pub struct AcceptDispatcher {
    listeners: ListenerSet,
    pool: Arc<WorkerPool>,
    relay_config: RelayConfig,
    stats: Arc<DispatchStats>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl AcceptDispatcher {
    /// Create a dispatcher over bound listeners.
    ///
    /// Fails if `listeners` is empty.
    pub fn new(listeners: ListenerSet, config: DispatcherConfig) -> Result<Self, DispatchError> {
        if listeners.is_empty() {
            return Err(DispatchError::NoListeners);
        }

        for listener in listeners.iter() {
            info!(
                local_addr = %listener.local_addr(),
                remote = %listener.rule().remote_endpoint(),
                "Registering accept listener"
            );
        }

        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            listeners,
            pool: Arc::new(WorkerPool::new(config.pool_size)),
            relay_config: config.relay,
            stats: Arc::new(DispatchStats::default()),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// The relay pool, for waiting on in-flight relays after the dispatcher stops.
    pub fn pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.pool)
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.local_addrs()
    }

    /// Accept and dispatch connections until stopped or until accepting fails.
    ///
    /// The shutdown sequence runs on every exit path: the pool stops admitting
    /// relays (running ones continue) and every listener is closed.
    pub async fn run(mut self) -> Result<(), DispatchError> {
        info!(
            listener_count = self.listeners.len(),
            pool_size = self.pool.size(),
            "Accept dispatcher started"
        );

        let result = self.accept_loop().await;
        if let Err(e) = &result {
            error!(error = %e, "Unrecoverable error while accepting, shutting down");
        }

        self.shutdown();
        result
    }

    async fn accept_loop(&mut self) -> Result<(), DispatchError> {
        let mut stop_rx = self.stop_rx.clone();

        loop {
            if *stop_rx.borrow_and_update() {
                info!("Accept dispatcher stop requested");
                return Ok(());
            }

            let listeners = &self.listeners;
            let ready = tokio::select! {
                biased;
                _ = stop_rx.changed() => continue,
                ready = poll_fn(|cx| poll_ready(listeners, cx)) => ready,
            };

            let mut back_off = false;
            for event in ready {
                back_off |= self.handle_ready(event)? == AcceptNext::BackOff;
            }

            // The pending connections stay queued; accepting again right away
            // would fail the same way.
            if back_off {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => {}
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }

    fn handle_ready(&self, event: ReadyAccept) -> Result<AcceptNext, DispatchError> {
        let port = event.rule.local_port();

        let e = match event.result {
            Ok((stream, peer_addr)) => {
                self.dispatch(stream, peer_addr, event.rule);
                return Ok(AcceptNext::Continue);
            }
            Err(e) => e,
        };

        match classify_accept_error(&e) {
            AcceptErrorKind::Transient => {
                warn!(local_port = port, error = %e, "Transient accept error");
                Ok(AcceptNext::Continue)
            }
            AcceptErrorKind::ResourceExhausted => {
                error!(
                    local_port = port,
                    error = %e,
                    active_relays = self.pool.active(),
                    "Out of resources while accepting, backing off"
                );
                Ok(AcceptNext::BackOff)
            }
            AcceptErrorKind::Fatal => Err(DispatchError::Accept { port, source: e }),
        }
    }

    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr, rule: Arc<ProxyRule>) {
        let local_port = rule.local_port();
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        info!(
            peer_addr = %peer_addr,
            local_port,
            "Connection accepted"
        );

        let relay = ConnectionRelay::new(stream, peer_addr, rule, &self.relay_config);
        let stats = Arc::clone(&self.stats);
        let task = async move {
            let outcome = relay.run().await;
            stats.record(&outcome);
        }
        .instrument(tracing::info_span!("relay", peer = %peer_addr, local_port));

        // A rejected task is dropped unstarted, which closes the connection.
        if let Err(e) = self.pool.submit(task) {
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                peer_addr = %peer_addr,
                local_port,
                error = %e,
                "Connection dropped, cannot relay it now"
            );
        }
    }

    fn shutdown(&mut self) {
        self.pool.shutdown();
        let closed = self.listeners.close_all();
        info!(
            listeners_closed = closed,
            active_relays = self.pool.active(),
            "Accept dispatcher stopped"
        );
    }
}

/// Collect every listener that has a connection ready.
fn poll_ready(listeners: &ListenerSet, cx: &mut Context<'_>) -> Poll<Vec<ReadyAccept>> {
    let ready: Vec<ReadyAccept> = listeners
        .iter()
        .filter_map(|listener| match listener.poll_accept(cx) {
            Poll::Ready(result) => Some(ReadyAccept {
                rule: Arc::clone(listener.rule()),
                result,
            }),
            Poll::Pending => None,
        })
        .collect();

    if ready.is_empty() {
        Poll::Pending
    } else {
        Poll::Ready(ready)
    }
}

/// What the accept loop does after handling a ready listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptNext {
    Continue,
    BackOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptErrorKind {
    /// Concerns only the connection being accepted.
    Transient,
    /// The process or system is short of descriptors, buffers or memory.
    /// Clears up as relays finish.
    ResourceExhausted,
    /// Anything else ends the dispatcher.
    Fatal,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const ENOBUFS: i32 = 105;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const ENOBUFS: i32 = 55;

/// `ENFILE`, `EMFILE`, `ENOMEM` and `ENOBUFS`.
#[cfg(unix)]
const RESOURCE_EXHAUSTION_CODES: &[i32] = &[23, 24, 12, ENOBUFS];

/// `WSAEMFILE` and `WSAENOBUFS`.
#[cfg(windows)]
const RESOURCE_EXHAUSTION_CODES: &[i32] = &[10024, 10055];

#[cfg(not(any(unix, windows)))]
const RESOURCE_EXHAUSTION_CODES: &[i32] = &[];

fn classify_accept_error(e: &io::Error) -> AcceptErrorKind {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => AcceptErrorKind::Transient,
        io::ErrorKind::OutOfMemory => AcceptErrorKind::ResourceExhausted,
        _ if e
            .raw_os_error()
            .is_some_and(|code| RESOURCE_EXHAUSTION_CODES.contains(&code)) =>
        {
            AcceptErrorKind::ResourceExhausted
        }
        _ => AcceptErrorKind::Fatal,
    }
}
