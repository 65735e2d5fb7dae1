//! Error types for rule loading.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::rule::RuleField;

/// Errors produced while loading or validating proxy rules.
///
/// Every variant is fatal for startup: the caller is expected to report the
/// error and refuse to start with a partial rule set.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The rule file does not exist at any of the searched locations.
    #[error("rule file not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// The rule file exists but could not be read.
    #[error("failed to read rule file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A line does not match `group.field = value`.
    #[error("syntax error at line {line}: {content:?}")]
    Syntax { line: usize, content: String },

    /// A port value is not an integer in 1..=65535.
    #[error("invalid port at line {line}: {value:?} (must be an integer in 1..=65535)")]
    InvalidPort { line: usize, value: String },

    /// A host value is neither an IPv4 address nor a valid hostname.
    #[error("invalid host at line {line}: {value:?}")]
    InvalidHost { line: usize, value: String },

    /// A group never set one of its three fields.
    #[error("rule {group:?} is missing {field}")]
    Incomplete { group: String, field: RuleField },

    /// The file contains no rules at all.
    #[error("rule file defines no proxy rules")]
    Empty,
}

impl ConfigError {
    /// Line number the error refers to, when it is tied to a single line.
    pub fn line(&self) -> Option<usize> {
        match self {
            ConfigError::Syntax { line, .. }
            | ConfigError::InvalidPort { line, .. }
            | ConfigError::InvalidHost { line, .. } => Some(*line),
            _ => None,
        }
    }
}

/// Errors produced when constructing a [`crate::ProxyRule`] directly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// Port 0 cannot be listened on or forwarded to.
    #[error("{field} must be in 1..=65535")]
    ZeroPort { field: RuleField },

    /// The remote host is neither an IPv4 address nor a valid hostname.
    #[error("invalid remote host: {0:?}")]
    InvalidHost(String),
}
