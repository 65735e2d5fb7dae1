//! Port mapper process configuration.
//!
//! Settings come from command line flags, each of which can also be set
//! through a `PORTMAP_*` environment variable. The proxy rules themselves live
//! in the rule file named by `--config`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use portmap_rules::DEFAULT_RULES_FILE;

use crate::proxy::{default_pool_size, DispatcherConfig, RelayConfig, DEFAULT_BUFFER_SIZE};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human readable lines.
    Pretty,
}

/// TCP port mapper: forwards local ports to remote endpoints.
#[derive(Debug, Clone, Parser)]
#[command(name = "port-mapper")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Rule file (`group.localPort|remoteHost|remotePort = value` lines).
    #[arg(long, env = "PORTMAP_CONFIG", default_value = DEFAULT_RULES_FILE)]
    pub config: PathBuf,

    /// Address every listener binds to.
    #[arg(long, env = "PORTMAP_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: IpAddr,

    /// Maximum concurrent relays (default: CPU cores x 6).
    #[arg(long, env = "PORTMAP_POOL_SIZE", value_parser = clap::value_parser!(u32).range(1..))]
    pub pool_size: Option<u32>,

    /// Relay buffer size in bytes, shared by both directions.
    #[arg(
        long,
        env = "PORTMAP_BUFFER_SIZE",
        default_value_t = DEFAULT_BUFFER_SIZE,
        value_parser = parse_buffer_size
    )]
    pub buffer_size: usize,

    /// Limit on connecting to a remote, in milliseconds (default: none).
    #[arg(long, env = "PORTMAP_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: Option<u64>,

    /// How long to wait for running relays on shutdown, in seconds.
    #[arg(long, env = "PORTMAP_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "PORTMAP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "PORTMAP_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,
}

impl Config {
    /// Dispatcher settings derived from this configuration.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            pool_size: self
                .pool_size
                .map(|size| size as usize)
                .unwrap_or_else(default_pool_size),
            relay: RelayConfig {
                buffer_size: self.buffer_size,
                connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
            },
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

fn parse_buffer_size(value: &str) -> Result<usize, String> {
    let size: usize = value
        .parse()
        .map_err(|_| format!("{value:?} is not a byte count"))?;

    if size < crate::proxy::MIN_BUFFER_SIZE {
        return Err(format!(
            "buffer size must be at least {} bytes",
            crate::proxy::MIN_BUFFER_SIZE
        ));
    }

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["port-mapper"]).unwrap();
        assert_eq!(config.config, PathBuf::from("proxy.properties"));
        assert_eq!(config.bind_host.to_string(), "0.0.0.0");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.drain_timeout(), Duration::from_secs(30));

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.pool_size, default_pool_size());
        assert_eq!(dispatcher.relay.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(dispatcher.relay.connect_timeout.is_none());
    }

    #[test]
    fn test_flags() {
        let config = Config::try_parse_from([
            "port-mapper",
            "--config",
            "/etc/portmap/rules.properties",
            "--bind-host",
            "127.0.0.1",
            "--pool-size",
            "3",
            "--buffer-size",
            "4096",
            "--connect-timeout-ms",
            "1500",
            "--log-format",
            "pretty",
        ])
        .unwrap();

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.pool_size, 3);
        assert_eq!(dispatcher.relay.buffer_size, 4096);
        assert_eq!(
            dispatcher.relay.connect_timeout,
            Some(Duration::from_millis(1500))
        );
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::try_parse_from(["port-mapper", "--pool-size", "0"]).is_err());
        assert!(Config::try_parse_from(["port-mapper", "--buffer-size", "16"]).is_err());
        assert!(Config::try_parse_from(["port-mapper", "--bind-host", "nowhere"]).is_err());
    }
}
