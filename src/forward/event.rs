//! Session progress and terminal notifications
//!
//! Events are advisory. They are broadcast to any number of subscribers and
//! a lagging subscriber simply misses some; sessions never wait on them.

use super::{ForwardRule, SpliceStats};
use std::net::SocketAddr;

/// Why a session left the listening state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was requested
    Cancelled,
    /// The listener itself failed
    Failed(String),
}

/// Event emitted by a forwarding session
#[derive(Debug, Clone)]
pub enum ForwardEvent {
    /// Listener is bound and accepting
    Ready {
        rule: ForwardRule,
        local_addr: SocketAddr,
    },
    /// A connection was accepted; `connection` counts from 1 per start
    Accepted {
        rule: ForwardRule,
        connection: u64,
        peer: SocketAddr,
    },
    /// Destination could not be reached for one accepted connection
    DialFailed {
        rule: ForwardRule,
        connection: u64,
        error: String,
    },
    /// Connection dropped because the session is at its connection limit
    Rejected {
        rule: ForwardRule,
        peer: SocketAddr,
    },
    /// A splice finished and both of its streams are closed
    SpliceClosed {
        rule: ForwardRule,
        connection: u64,
        stats: SpliceStats,
        error: Option<String>,
    },
    /// Session stopped and every splice is torn down
    Stopped { rule: ForwardRule, reason: StopReason },
}

impl ForwardEvent {
    /// Rule of the session that emitted the event
    pub fn rule(&self) -> &ForwardRule {
        match self {
            ForwardEvent::Ready { rule, .. } => rule,
            ForwardEvent::Accepted { rule, .. } => rule,
            ForwardEvent::DialFailed { rule, .. } => rule,
            ForwardEvent::Rejected { rule, .. } => rule,
            ForwardEvent::SpliceClosed { rule, .. } => rule,
            ForwardEvent::Stopped { rule, .. } => rule,
        }
    }
}
