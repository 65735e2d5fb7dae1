pub mod config;
pub mod error;
pub mod proxy;

pub use config::{Config, LogFormat};
pub use error::{BindError, DispatchError, PoolError};
pub use proxy::{
    AcceptDispatcher, ConnectionRelay, DispatchStats, DispatcherConfig, Leg, Listener,
    ListenerSet, RelayConfig, RelayOutcome, RelayState, StopHandle, Termination, WorkerPool,
};
