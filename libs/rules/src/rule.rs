//! The proxy rule model and its field validation.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::RuleError;

/// Maximum length of a hostname (RFC 1123).
const MAX_HOSTNAME_LEN: usize = 253;

/// Maximum length of a single hostname label.
const MAX_LABEL_LEN: usize = 63;

/// A field of a rule group in the rule file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleField {
    LocalPort,
    RemotePort,
    RemoteHost,
}

impl RuleField {
    /// The key used for this field in the rule file.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleField::LocalPort => "localPort",
            RuleField::RemotePort => "remotePort",
            RuleField::RemoteHost => "remoteHost",
        }
    }
}

impl fmt::Display for RuleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleField {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "localPort" => Ok(RuleField::LocalPort),
            "remotePort" => Ok(RuleField::RemotePort),
            "remoteHost" => Ok(RuleField::RemoteHost),
            _ => Err(()),
        }
    }
}

/// A local port to remote endpoint mapping.
///
/// Immutable once constructed. Ports are always in 1..=65535 and the host is
/// always a valid IPv4 address or hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyRule {
    local_port: u16,
    remote_host: String,
    remote_port: u16,
}

impl ProxyRule {
    /// Create a validated rule.
    pub fn new(
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Result<Self, RuleError> {
        let remote_host = remote_host.into();

        if local_port == 0 {
            return Err(RuleError::ZeroPort {
                field: RuleField::LocalPort,
            });
        }
        if remote_port == 0 {
            return Err(RuleError::ZeroPort {
                field: RuleField::RemotePort,
            });
        }
        if !is_valid_host(&remote_host) {
            return Err(RuleError::InvalidHost(remote_host));
        }

        Ok(Self {
            local_port,
            remote_host,
            remote_port,
        })
    }

    /// Build a rule from fields the parser has already validated.
    pub(crate) fn from_validated(local_port: u16, remote_host: String, remote_port: u16) -> Self {
        debug_assert!(local_port != 0 && remote_port != 0 && is_valid_host(&remote_host));
        Self {
            local_port,
            remote_host,
            remote_port,
        }
    }

    /// Port the proxy listens on.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Host every accepted connection is forwarded to.
    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// Port every accepted connection is forwarded to.
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// The remote endpoint as `host:port`.
    pub fn remote_endpoint(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl fmt::Display for ProxyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}:{}",
            self.local_port, self.remote_host, self.remote_port
        )
    }
}

/// Parse a port value: 1 to 5 decimal digits, in 1..=65535.
pub fn parse_port(value: &str) -> Option<u16> {
    if value.is_empty() || value.len() > 5 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    match value.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// Check that `value` is an IPv4 dotted quad or an RFC 1123 hostname.
pub fn is_valid_host(value: &str) -> bool {
    value.parse::<Ipv4Addr>().is_ok() || is_valid_hostname(value)
}

fn is_valid_hostname(value: &str) -> bool {
    if value.is_empty() || value.len() > MAX_HOSTNAME_LEN {
        return false;
    }

    let mut all_numeric = true;
    for label in value.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return false;
        }
        all_numeric &= label.bytes().all(|b| b.is_ascii_digit());
    }

    // Dotted digits that failed the IPv4 parse (e.g. "256.1.1.1") are not hostnames.
    !all_numeric
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_accessors() {
        let rule = ProxyRule::new(8080, "example.com", 80).unwrap();
        assert_eq!(rule.local_port(), 8080);
        assert_eq!(rule.remote_host(), "example.com");
        assert_eq!(rule.remote_port(), 80);
        assert_eq!(rule.remote_endpoint(), "example.com:80");
        assert_eq!(rule.to_string(), "8080 -> example.com:80");
    }

    #[test]
    fn test_rule_rejects_zero_ports() {
        assert_eq!(
            ProxyRule::new(0, "example.com", 80),
            Err(RuleError::ZeroPort {
                field: RuleField::LocalPort
            })
        );
        assert_eq!(
            ProxyRule::new(8080, "example.com", 0),
            Err(RuleError::ZeroPort {
                field: RuleField::RemotePort
            })
        );
    }

    #[test]
    fn test_rule_rejects_bad_host() {
        assert!(matches!(
            ProxyRule::new(8080, "bad_host!", 80),
            Err(RuleError::InvalidHost(_))
        ));
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("1"), Some(1));
        assert_eq!(parse_port("65535"), Some(65535));
        assert_eq!(parse_port("0"), None);
        assert_eq!(parse_port("65536"), None);
        assert_eq!(parse_port("99999"), None);
        assert_eq!(parse_port("000080"), None);
        assert_eq!(parse_port("+80"), None);
        assert_eq!(parse_port(""), None);
    }

    #[test]
    fn test_host_validation() {
        assert!(is_valid_host("127.0.0.1"));
        assert!(is_valid_host("255.255.255.255"));
        assert!(is_valid_host("localhost"));
        assert!(is_valid_host("db-1.internal.example.com"));
        assert!(is_valid_host("3com.net"));

        assert!(!is_valid_host(""));
        assert!(!is_valid_host("256.1.1.1"));
        assert!(!is_valid_host("10.0.0"));
        assert!(!is_valid_host("-leading.example.com"));
        assert!(!is_valid_host("trailing-.example.com"));
        assert!(!is_valid_host("double..dot"));
        assert!(!is_valid_host("under_score.com"));
        assert!(!is_valid_host(&"a".repeat(64)));
    }

    #[test]
    fn test_rule_field_round_trip() {
        for field in [
            RuleField::LocalPort,
            RuleField::RemotePort,
            RuleField::RemoteHost,
        ] {
            assert_eq!(field.as_str().parse::<RuleField>(), Ok(field));
        }
        assert!("remoteport".parse::<RuleField>().is_err());
    }
}
