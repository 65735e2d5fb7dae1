//! Proxy rules for portmap.
//!
//! This library provides:
//! - The [`ProxyRule`] model (local port to remote endpoint mapping)
//! - Port and host validation
//! - Parsing of the `proxy.properties` rule file
//!
//! ## Rule file format
//!
//! ```text
//! # comment
//! web.localPort  = 8080
//! web.remoteHost = example.com
//! web.remotePort = 80
//! ```
//!
//! Lines of the same group accumulate into one rule. Any malformed line is
//! reported as a [`ConfigError`] carrying its line number.

mod error;
mod parser;
mod rule;

pub use error::{ConfigError, RuleError};
pub use parser::{load_rules, parse_rules, resolve_rules_path, RuleSet, DEFAULT_RULES_FILE};
pub use rule::{is_valid_host, parse_port, ProxyRule, RuleField};
