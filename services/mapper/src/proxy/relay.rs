//! Per-connection relay.
//!
//! A [`ConnectionRelay`] serves one accepted connection for its whole life:
//!
//! ```text
//! Connecting --connect ok--> Relaying --eof / io error--> Closed
//!     |                                                     ^
//!     +----------------connect failed-----------------------+
//! ```
//!
//! Both directions are driven by one task waiting on socket readiness. The
//! relay buffer is split in two halves, one per direction. A half that still
//! holds bytes the destination did not accept stops reading from its source
//! until the destination becomes writable again, so partial writes never lose
//! data and a slow consumer pushes back on its producer through the OS socket
//! buffers.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portmap_rules::ProxyRule;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Default relay buffer size, shared by both directions.
pub const DEFAULT_BUFFER_SIZE: usize = 24 * 1024;

/// Smallest relay buffer accepted.
pub const MIN_BUFFER_SIZE: usize = 1024;

/// Read/write rounds per readiness event before other work gets a turn.
const MAX_BURST: usize = 16;

/// Settings shared by every relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Total buffer size, split between the two directions.
    pub buffer_size: usize,
    /// Limit on connecting to the remote; none waits for the OS.
    pub connect_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: None,
        }
    }
}

/// Lifecycle of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Relaying,
    Closed,
}

/// One side of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// The accepted connection.
    Client,
    /// The outbound connection to the rule's remote endpoint.
    Remote,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Client => f.write_str("client"),
            Leg::Remote => f.write_str("remote"),
        }
    }
}

/// Why a relay ended.
#[derive(Debug)]
pub enum Termination {
    /// The outbound connection could not be established.
    ConnectFailed(io::Error),
    /// A leg reached end of stream.
    Graceful { leg: Leg },
    /// A leg failed with an I/O error.
    Forced { leg: Leg, error: io::Error },
}

impl Termination {
    pub fn is_graceful(&self) -> bool {
        matches!(self, Termination::Graceful { .. })
    }

    /// The leg that signaled the end.
    pub fn leg(&self) -> Leg {
        match self {
            Termination::ConnectFailed(_) => Leg::Remote,
            Termination::Graceful { leg } | Termination::Forced { leg, .. } => *leg,
        }
    }
}

/// Result of a finished relay.
#[derive(Debug)]
pub struct RelayOutcome {
    pub termination: Termination,
    /// Bytes copied from the client to the remote.
    pub bytes_to_remote: u64,
    /// Bytes copied from the remote to the client.
    pub bytes_to_client: u64,
}

/// Relay between one accepted connection and its remote endpoint.
pub struct ConnectionRelay {
    client: TcpStream,
    remote: Option<TcpStream>,
    peer_addr: SocketAddr,
    rule: Arc<ProxyRule>,
    buffer: Box<[u8]>,
    connect_timeout: Option<Duration>,
    state: RelayState,
}

impl ConnectionRelay {
    /// Prepare a relay for an accepted connection. No I/O happens until
    /// [`ConnectionRelay::run`].
    pub fn new(
        client: TcpStream,
        peer_addr: SocketAddr,
        rule: Arc<ProxyRule>,
        config: &RelayConfig,
    ) -> Self {
        let buffer_size = config.buffer_size.max(MIN_BUFFER_SIZE);

        Self {
            client,
            remote: None,
            peer_addr,
            rule,
            buffer: vec![0u8; buffer_size].into_boxed_slice(),
            connect_timeout: config.connect_timeout,
            state: RelayState::Connecting,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn rule(&self) -> &Arc<ProxyRule> {
        &self.rule
    }

    /// Connect to the remote and relay until either leg ends.
    ///
    /// Consumes the relay: both legs are closed when this returns, whatever
    /// the outcome.
    pub async fn run(mut self) -> RelayOutcome {
        let outcome = self.connect_and_relay().await;
        self.teardown(outcome.termination.leg()).await;

        match &outcome.termination {
            Termination::ConnectFailed(error) => {
                warn!(
                    remote = %self.rule.remote_endpoint(),
                    error = %error,
                    "Failed to connect to remote"
                );
            }
            Termination::Graceful { leg } => {
                info!(leg = %leg, "Connection closed gracefully");
            }
            Termination::Forced { leg, error } => {
                warn!(leg = %leg, error = %error, "Connection closed forcibly");
            }
        }

        debug!(
            bytes_to_remote = outcome.bytes_to_remote,
            bytes_to_client = outcome.bytes_to_client,
            "Relay finished"
        );

        outcome
    }

    async fn connect_and_relay(&mut self) -> RelayOutcome {
        let remote = match self.connect().await {
            Ok(remote) => remote,
            Err(error) => {
                return RelayOutcome {
                    termination: Termination::ConnectFailed(error),
                    bytes_to_remote: 0,
                    bytes_to_client: 0,
                }
            }
        };

        debug!(
            remote = %self.rule.remote_endpoint(),
            "Connected to remote"
        );
        self.state = RelayState::Relaying;
        let remote = self.remote.insert(remote);

        relay_streams(&self.client, remote, &mut self.buffer).await
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        let target = (self.rule.remote_host(), self.rule.remote_port());

        match self.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, TcpStream::connect(target)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
            },
            None => TcpStream::connect(target).await,
        }
    }

    /// Shut down the leg that signaled first, then the other one. The sockets
    /// are released when the relay is dropped.
    async fn teardown(&mut self, signaled: Leg) {
        self.state = RelayState::Closed;

        match signaled {
            Leg::Client => {
                close_leg(Some(&mut self.client)).await;
                close_leg(self.remote.as_mut()).await;
            }
            Leg::Remote => {
                close_leg(self.remote.as_mut()).await;
                close_leg(Some(&mut self.client)).await;
            }
        }
    }
}

async fn close_leg(leg: Option<&mut TcpStream>) {
    if let Some(stream) = leg {
        // The peer may already be gone.
        let _ = stream.shutdown().await;
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Client to remote.
    Upstream,
    /// Remote to client.
    Downstream,
}

impl Direction {
    fn source(self) -> Leg {
        match self {
            Direction::Upstream => Leg::Client,
            Direction::Downstream => Leg::Remote,
        }
    }
}

enum Flow {
    /// Source or destination would block; wait for the next event.
    Open,
    /// Source reached end of stream.
    Eof,
}

struct Fault {
    leg: Leg,
    error: io::Error,
}

/// One direction's half of the relay buffer. Bytes in `start..end` were read
/// from the source but not yet accepted by the destination.
struct Pipe<'a> {
    buf: &'a mut [u8],
    start: usize,
    end: usize,
    transferred: u64,
}

impl<'a> Pipe<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            start: 0,
            end: 0,
            transferred: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Copy from `src` to `dst` until one of them would block.
    fn pump(
        &mut self,
        (src, src_leg): (&TcpStream, Leg),
        (dst, dst_leg): (&TcpStream, Leg),
    ) -> Result<Flow, Fault> {
        for _ in 0..MAX_BURST {
            if self.is_empty() {
                self.start = 0;
                self.end = 0;

                match src.try_read(self.buf) {
                    Ok(0) => return Ok(Flow::Eof),
                    Ok(n) => self.end = n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Open),
                    Err(error) => {
                        return Err(Fault {
                            leg: src_leg,
                            error,
                        })
                    }
                }
            }

            match dst.try_write(&self.buf[self.start..self.end]) {
                Ok(0) => {
                    return Err(Fault {
                        leg: dst_leg,
                        error: io::ErrorKind::WriteZero.into(),
                    })
                }
                Ok(n) => {
                    self.start += n;
                    self.transferred += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flow::Open),
                Err(error) => {
                    return Err(Fault {
                        leg: dst_leg,
                        error,
                    })
                }
            }
        }

        Ok(Flow::Open)
    }
}

/// Copy bytes both ways until a leg ends.
async fn relay_streams(client: &TcpStream, remote: &TcpStream, buffer: &mut [u8]) -> RelayOutcome {
    let half = buffer.len() / 2;
    let (up_buf, down_buf) = buffer.split_at_mut(half);
    let mut upstream = Pipe::new(up_buf);
    let mut downstream = Pipe::new(down_buf);

    let termination = loop {
        // An empty pipe waits for its source, a pipe with pending bytes for
        // its destination. Exactly one branch per pipe is enabled.
        let ready = tokio::select! {
            r = client.readable(), if upstream.is_empty() => {
                r.map(|()| Direction::Upstream).map_err(|e| (Leg::Client, e))
            }
            r = remote.writable(), if !upstream.is_empty() => {
                r.map(|()| Direction::Upstream).map_err(|e| (Leg::Remote, e))
            }
            r = remote.readable(), if downstream.is_empty() => {
                r.map(|()| Direction::Downstream).map_err(|e| (Leg::Remote, e))
            }
            r = client.writable(), if !downstream.is_empty() => {
                r.map(|()| Direction::Downstream).map_err(|e| (Leg::Client, e))
            }
        };

        let direction = match ready {
            Ok(direction) => direction,
            Err((leg, error)) => break Termination::Forced { leg, error },
        };

        let flow = match direction {
            Direction::Upstream => {
                upstream.pump((client, Leg::Client), (remote, Leg::Remote))
            }
            Direction::Downstream => {
                downstream.pump((remote, Leg::Remote), (client, Leg::Client))
            }
        };

        match flow {
            Ok(Flow::Open) => {}
            Ok(Flow::Eof) => {
                break Termination::Graceful {
                    leg: direction.source(),
                }
            }
            Err(Fault { leg, error }) => break Termination::Forced { leg, error },
        }
    };

    RelayOutcome {
        termination,
        bytes_to_remote: upstream.transferred,
        bytes_to_client: downstream.transferred,
    }
}
