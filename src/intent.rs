//! Rule intent parsing
//!
//! Turns one free-form input line into a forward rule plus the action to
//! apply to it. Grammar:
//!
//! ```text
//! intent      := source [ "=" destination ] "/" action
//! source      := [ host ":" ] port
//! destination := host ":" port
//! action      := "add" | "remove"
//! ```
//!
//! Examples:
//! - `127.0.0.1:8080=10.0.0.5:80/add`
//! - `0.0.0.0:8080/remove`
//! - `[::1]:8080=db.internal:5432/add`
//!
//! Without a destination the rule points at `localhost` on the source port.
//! That rule is syntactically valid but loops back into its own listener, so
//! [`ForwardRule::validate`] rejects it before it can be stored or started.

use crate::forward::ForwardRule;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Source host used when the input gives only a port
pub const DEFAULT_SOURCE_HOST: &str = "127.0.0.1";

/// Destination host used when the input gives no destination
pub const DEFAULT_DESTINATION_HOST: &str = "localhost";

/// Intent parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntentError {
    #[error("Empty input")]
    Empty,

    #[error("Missing action, expected '/add' or '/remove'")]
    MissingAction,

    #[error("Unknown action: {0} (expected 'add' or 'remove')")]
    UnknownAction(String),

    #[error("Invalid port: {0:?}")]
    InvalidPort(String),

    #[error("Port out of range (1-65535): {0}")]
    PortOutOfRange(u64),

    #[error("Missing host before ':'")]
    MissingHost,

    #[error("Invalid destination: {0:?} (expected host:port)")]
    InvalidDestination(String),
}

/// What to do with the parsed rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Add,
    Remove,
}

impl FromStr for RuleAction {
    type Err = IntentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(RuleAction::Add),
            "remove" => Ok(RuleAction::Remove),
            "" => Err(IntentError::MissingAction),
            other => Err(IntentError::UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Add => write!(f, "add"),
            RuleAction::Remove => write!(f, "remove"),
        }
    }
}

/// A parsed intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleIntent {
    pub rule: ForwardRule,
    pub action: RuleAction,
}

impl FromStr for RuleIntent {
    type Err = IntentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_intent(s)
    }
}

/// Parse one intent line
pub fn parse_intent(input: &str) -> Result<RuleIntent, IntentError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(IntentError::Empty);
    }

    let (endpoints, action) = input.rsplit_once('/').ok_or(IntentError::MissingAction)?;
    let action: RuleAction = action.trim().parse()?;

    let (source, destination) = match endpoints.split_once('=') {
        Some((source, destination)) => (source.trim(), Some(destination.trim())),
        None => (endpoints.trim(), None),
    };

    let (source_host, source_port) = match split_host_port(source)? {
        (Some(host), port) => (host, port),
        (None, port) => (DEFAULT_SOURCE_HOST.to_string(), port),
    };

    let (destination_host, destination_port) = match destination {
        Some(destination) => match split_host_port(destination)? {
            (Some(host), port) => (host, port),
            (None, _) => return Err(IntentError::InvalidDestination(destination.to_string())),
        },
        None => (DEFAULT_DESTINATION_HOST.to_string(), source_port),
    };

    Ok(RuleIntent {
        rule: ForwardRule::new(source_host, source_port, destination_host, destination_port),
        action,
    })
}

/// Split `[host:]port`, unbracketing IPv6 literals
fn split_host_port(s: &str) -> Result<(Option<String>, u16), IntentError> {
    match s.rsplit_once(':') {
        Some((host, port)) => {
            let host = host.trim();
            let host = host
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(host);
            if host.is_empty() {
                return Err(IntentError::MissingHost);
            }
            Ok((Some(host.to_string()), parse_port(port)?))
        }
        None => Ok((None, parse_port(s)?)),
    }
}

fn parse_port(s: &str) -> Result<u16, IntentError> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IntentError::InvalidPort(s.to_string()));
    }
    let port: u64 = s
        .parse()
        .map_err(|_| IntentError::InvalidPort(s.to_string()))?;
    if !(1..=65535).contains(&port) {
        return Err(IntentError::PortOutOfRange(port));
    }
    Ok(port as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_only() {
        let intent = parse_intent("8080/add").unwrap();
        assert_eq!(intent.action, RuleAction::Add);
        assert_eq!(
            intent.rule,
            ForwardRule::new("127.0.0.1", 8080, "localhost", 8080)
        );
    }

    #[test]
    fn test_short_add_form_fails_validation() {
        let intent = parse_intent("8080/add").unwrap();
        assert!(intent.rule.is_self_loop());
        assert!(matches!(
            intent.rule.validate(),
            Err(crate::forward::ForwardError::InvalidRule(_))
        ));

        let intent = parse_intent("8080=10.0.0.5:8080/add").unwrap();
        assert!(intent.rule.validate().is_ok());
    }

    #[test]
    fn test_parse_host_and_port() {
        let intent = parse_intent("0.0.0.0:3000/remove").unwrap();
        assert_eq!(intent.action, RuleAction::Remove);
        assert_eq!(intent.rule.source_host, "0.0.0.0");
        assert_eq!(intent.rule.source_port, 3000);
        assert_eq!(intent.rule.destination_port, 3000);
    }

    #[test]
    fn test_parse_explicit_destination() {
        let intent: RuleIntent = " 127.0.0.1:8080 = 10.0.0.5:80 / add ".parse().unwrap();
        assert_eq!(
            intent.rule,
            ForwardRule::new("127.0.0.1", 8080, "10.0.0.5", 80)
        );

        let intent = parse_intent("9000=db.internal:5432/add").unwrap();
        assert_eq!(
            intent.rule,
            ForwardRule::new("127.0.0.1", 9000, "db.internal", 5432)
        );
    }

    #[test]
    fn test_parse_ipv6() {
        let intent = parse_intent("[::1]:8080=[::1]:80/add").unwrap();
        assert_eq!(intent.rule, ForwardRule::new("::1", 8080, "::1", 80));
    }

    #[test]
    fn test_rejects_bad_actions() {
        assert_eq!(parse_intent(""), Err(IntentError::Empty));
        assert_eq!(parse_intent("8080"), Err(IntentError::MissingAction));
        assert_eq!(parse_intent("8080/"), Err(IntentError::MissingAction));
        assert_eq!(
            parse_intent("8080/delete"),
            Err(IntentError::UnknownAction("delete".to_string()))
        );
        assert_eq!(
            parse_intent("8080/Add"),
            Err(IntentError::UnknownAction("Add".to_string()))
        );
    }

    #[test]
    fn test_rejects_bad_ports() {
        assert_eq!(parse_intent("0/add"), Err(IntentError::PortOutOfRange(0)));
        assert_eq!(
            parse_intent("65536/add"),
            Err(IntentError::PortOutOfRange(65536))
        );
        assert_eq!(
            parse_intent("http/add"),
            Err(IntentError::InvalidPort("http".to_string()))
        );
        assert_eq!(
            parse_intent("-1/add"),
            Err(IntentError::InvalidPort("-1".to_string()))
        );
        assert_eq!(
            parse_intent("localhost:/add"),
            Err(IntentError::InvalidPort(String::new()))
        );
    }

    #[test]
    fn test_rejects_bad_hosts() {
        assert_eq!(parse_intent(":8080/add"), Err(IntentError::MissingHost));
        assert_eq!(
            parse_intent("8080=80/add"),
            Err(IntentError::InvalidDestination("80".to_string()))
        );
    }
}
