//! TCP port mapping core.
//!
//! This module provides:
//! - Listening sockets, one per rule
//! - A single accept dispatcher over all listeners
//! - A bounded worker pool that sheds connections when full
//! - The per-connection relay
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener --+
//! Client -> Listener --+--> AcceptDispatcher -> WorkerPool -> ConnectionRelay -> Remote
//! Client -> Listener --+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{AcceptDispatcher, DispatcherConfig, ListenerSet};
//!
//! let listeners = ListenerSet::bind(rules.into_values(), "0.0.0.0".parse()?).await;
//! let dispatcher = AcceptDispatcher::new(listeners, DispatcherConfig::default())?;
//! dispatcher.run().await?;
//! ```

mod dispatcher;
mod listener;
mod pool;
mod relay;

pub use dispatcher::{AcceptDispatcher, DispatchStats, DispatcherConfig, StopHandle};
pub use listener::{Listener, ListenerSet};
pub use pool::{default_pool_size, WorkerPool, RELAY_POOL_SCALE};
pub use relay::{
    ConnectionRelay, Leg, RelayConfig, RelayOutcome, RelayState, Termination,
    DEFAULT_BUFFER_SIZE, MIN_BUFFER_SIZE,
};
