//! Listening sockets, one per proxy rule.
//!
//! A [`Listener`] owns one non-blocking listening socket and the rule it
//! serves, so the dispatcher can recover the remote target of every accepted
//! connection. Bind failures are per rule: [`ListenerSet::bind`] logs them and
//! keeps the rules that did bind.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use portmap_rules::ProxyRule;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::error::BindError;

/// A bound listening socket and the rule it forwards to.
#[derive(Debug)]
pub struct Listener {
    /// Rule attached to every connection accepted here.
    rule: Arc<ProxyRule>,
    /// Address the socket was bound to.
    local_addr: SocketAddr,
    /// The socket; `None` once closed.
    socket: Option<TcpListener>,
}

impl Listener {
    /// Bind a listening socket on `bind_host:rule.local_port()`.
    pub async fn bind(rule: Arc<ProxyRule>, bind_host: IpAddr) -> Result<Self, BindError> {
        let port = rule.local_port();

        let socket = TcpListener::bind((bind_host, port))
            .await
            .map_err(|e| BindError::from_io(port, e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| BindError::from_io(port, e))?;

        info!(
            local_addr = %local_addr,
            remote = %rule.remote_endpoint(),
            "Listener bound"
        );

        Ok(Self {
            rule,
            local_addr,
            socket: Some(socket),
        })
    }

    /// The rule served by this listener.
    pub fn rule(&self) -> &Arc<ProxyRule> {
        &self.rule
    }

    /// The address this listener was bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Poll for a pending connection.
    ///
    /// A closed listener never becomes ready.
    pub fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        match &self.socket {
            Some(socket) => socket.poll_accept(cx),
            None => Poll::Pending,
        }
    }

    /// Close the socket.
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        match self.socket.take() {
            Some(socket) => {
                drop(socket);
                debug!(local_addr = %self.local_addr, "Listener closed");
                true
            }
            None => false,
        }
    }
}

/// All listeners of the process.
#[derive(Debug, Default)]
pub struct ListenerSet {
    listeners: Vec<Listener>,
    failures: Vec<BindError>,
}

impl ListenerSet {
    /// Bind one listener per rule.
    ///
    /// Rules whose port cannot be bound are dropped with a log entry and
    /// recorded in [`ListenerSet::failures`].
    pub async fn bind<I>(rules: I, bind_host: IpAddr) -> Self
    where
        I: IntoIterator<Item = ProxyRule>,
    {
        let mut set = Self::default();

        for rule in rules {
            let rule = Arc::new(rule);
            match Listener::bind(Arc::clone(&rule), bind_host).await {
                Ok(listener) => set.listeners.push(listener),
                Err(e @ BindError::AddrInUse { .. }) => {
                    warn!(
                        local_port = rule.local_port(),
                        "Port is already in use, not listening on it"
                    );
                    set.failures.push(e);
                }
                Err(e) => {
                    error!(
                        local_port = rule.local_port(),
                        error = %e,
                        "Failed to listen on port, not listening on it"
                    );
                    set.failures.push(e);
                }
            }
        }

        set
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Listener> {
        self.listeners.iter()
    }

    /// Bind failures of the rules that were skipped.
    pub fn failures(&self) -> &[BindError] {
        &self.failures
    }

    /// Addresses of all listeners, in rule order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(Listener::local_addr).collect()
    }

    /// Close every listener. Returns how many were still open.
    pub fn close_all(&mut self) -> usize {
        self.listeners
            .iter_mut()
            .map(Listener::close)
            .filter(|closed| *closed)
            .count()
    }
}
