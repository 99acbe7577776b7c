//! Forward rule definition

use super::ForwardError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Address used when a rule leaves its source host empty
pub const ALL_INTERFACES: &str = "0.0.0.0";

/// A configured (source, destination) TCP endpoint pair.
///
/// The full 4-tuple is the rule identity. Rules are immutable: changing any
/// field means removing the old rule and adding a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForwardRule {
    /// Local host to listen on (empty = all interfaces)
    #[serde(default)]
    pub source_host: String,
    /// Local port to listen on
    pub source_port: u16,
    /// Host to relay connections to
    pub destination_host: String,
    /// Port to relay connections to
    pub destination_port: u16,
}

impl ForwardRule {
    /// Create a new rule
    pub fn new(
        source_host: impl Into<String>,
        source_port: u16,
        destination_host: impl Into<String>,
        destination_port: u16,
    ) -> Self {
        Self {
            source_host: source_host.into(),
            source_port,
            destination_host: destination_host.into(),
            destination_port,
        }
    }

    /// Check ports and hosts before the rule is used
    pub fn validate(&self) -> Result<(), ForwardError> {
        if self.source_port == 0 {
            return Err(ForwardError::InvalidRule(format!(
                "source port must be in 1-65535: {}",
                self
            )));
        }
        if self.destination_port == 0 {
            return Err(ForwardError::InvalidRule(format!(
                "destination port must be in 1-65535: {}",
                self
            )));
        }
        if self.destination_host.trim().is_empty() {
            return Err(ForwardError::InvalidRule(format!(
                "destination host is empty: {}",
                self
            )));
        }
        if self.is_self_loop() {
            return Err(ForwardError::InvalidRule(format!(
                "destination is the forward's own listener: {}",
                self
            )));
        }
        Ok(())
    }

    /// Whether the destination resolves to this rule's own listener.
    ///
    /// Such a rule dials itself for every accepted connection until the
    /// connection limit is exhausted.
    pub fn is_self_loop(&self) -> bool {
        if self.source_port != self.destination_port {
            return false;
        }
        let source = normalize_host(&self.source_host);
        let destination = normalize_host(&self.destination_host);
        source == destination || (is_local_host(&source) && is_local_host(&destination))
    }

    /// Address the session listens on
    pub fn listen_addr(&self) -> String {
        let host = if self.source_host.is_empty() {
            ALL_INTERFACES
        } else {
            self.source_host.as_str()
        };
        join_host_port(host, self.source_port)
    }

    /// Address each accepted connection is relayed to
    pub fn destination_addr(&self) -> String {
        join_host_port(&self.destination_host, self.destination_port)
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.listen_addr(), self.destination_addr())
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim();
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_ascii_lowercase()
}

/// Loopback or wildcard: a listener there accepts connections dialed to loopback
fn is_local_host(host: &str) -> bool {
    match host {
        "" | "localhost" => true,
        other => other
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback() || ip.is_unspecified())
            .unwrap_or(false),
    }
}

/// Bracket bare IPv6 literals so the result parses as `host:port`
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
