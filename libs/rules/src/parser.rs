//! `proxy.properties` parsing.
//!
//! Each non-comment line has the shape `group.field = value` where `field` is
//! one of `localPort`, `remotePort` or `remoteHost`. Lines of the same group
//! accumulate; a later line overrides an earlier value of the same field.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::ConfigError;
use crate::rule::{is_valid_host, parse_port, ProxyRule, RuleField};

/// Rule file name used when none is configured.
pub const DEFAULT_RULES_FILE: &str = "proxy.properties";

/// Validated rules keyed by group name.
pub type RuleSet = BTreeMap<String, ProxyRule>;

/// Fields collected for one group while the file is being read.
#[derive(Debug, Default)]
struct PartialRule {
    local_port: Option<u16>,
    remote_host: Option<String>,
    remote_port: Option<u16>,
}

impl PartialRule {
    fn finish(self, group: &str) -> Result<ProxyRule, ConfigError> {
        let missing = |field| ConfigError::Incomplete {
            group: group.to_string(),
            field,
        };

        let local_port = self.local_port.ok_or_else(|| missing(RuleField::LocalPort))?;
        let remote_host = self
            .remote_host
            .ok_or_else(|| missing(RuleField::RemoteHost))?;
        let remote_port = self
            .remote_port
            .ok_or_else(|| missing(RuleField::RemotePort))?;

        Ok(ProxyRule::from_validated(local_port, remote_host, remote_port))
    }
}

/// Parse rule file contents.
pub fn parse_rules(input: &str) -> Result<RuleSet, ConfigError> {
    let mut groups: BTreeMap<String, PartialRule> = BTreeMap::new();

    for (idx, raw) in input.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some((group, field, value)) = split_line(trimmed) else {
            return Err(ConfigError::Syntax {
                line,
                content: raw.to_string(),
            });
        };

        let partial = groups.entry(group.to_string()).or_default();
        match field {
            RuleField::LocalPort => {
                partial.local_port = Some(port_value(line, value)?);
            }
            RuleField::RemotePort => {
                partial.remote_port = Some(port_value(line, value)?);
            }
            RuleField::RemoteHost => {
                if !is_valid_host(value) {
                    return Err(ConfigError::InvalidHost {
                        line,
                        value: value.to_string(),
                    });
                }
                partial.remote_host = Some(value.to_string());
            }
        }
    }

    if groups.is_empty() {
        return Err(ConfigError::Empty);
    }

    groups
        .into_iter()
        .map(|(group, partial)| {
            let rule = partial.finish(&group)?;
            debug!(group = %group, rule = %rule, "Rule parsed");
            Ok((group, rule))
        })
        .collect()
}

/// Locate the rule file.
///
/// The path is used as given when it exists. A relative path that does not
/// exist is also looked up next to the running executable.
pub fn resolve_rules_path(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }

    if path.is_relative() {
        let beside_exe = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(path)));

        if let Some(candidate) = beside_exe.filter(|p| p.exists()) {
            debug!(path = %candidate.display(), "Using rule file next to executable");
            return Ok(candidate);
        }
    }

    Err(ConfigError::NotFound {
        path: path.to_path_buf(),
    })
}

/// Locate, read and parse a rule file.
pub fn load_rules(path: &Path) -> Result<RuleSet, ConfigError> {
    let path = resolve_rules_path(path)?;

    let contents = fs::read_to_string(&path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => ConfigError::NotFound { path: path.clone() },
        _ => ConfigError::Read {
            path: path.clone(),
            source,
        },
    })?;

    let rules = parse_rules(&contents)?;
    info!(
        path = %path.display(),
        rule_count = rules.len(),
        "Rule file loaded"
    );

    Ok(rules)
}

/// Split `group.field = value`, returning `None` on any syntax problem.
fn split_line(line: &str) -> Option<(&str, RuleField, &str)> {
    let (key, value) = line.split_once('=')?;
    let (group, field) = key.trim().split_once('.')?;

    if !is_valid_group(group) {
        return None;
    }

    let field = field.parse::<RuleField>().ok()?;

    let value = value.trim();
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
    {
        return None;
    }

    Some((group, field, value))
}

fn is_valid_group(group: &str) -> bool {
    !group.is_empty()
        && group
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn port_value(line: usize, value: &str) -> Result<u16, ConfigError> {
    parse_port(value).ok_or_else(|| ConfigError::InvalidPort {
        line,
        value: value.to_string(),
    })
}
