//! Forwarding engine
//!
//! Provides:
//! - Forward rules and their identity
//! - Port availability pre-flight checks
//! - Bidirectional stream splicing
//! - Per-rule forwarding sessions (listener + in-flight splices)
//! - A registry of concurrently running sessions

mod dial;
mod event;
mod port;
mod registry;
mod rule;
mod session;
mod splice;

pub use dial::dial;
pub use event::{ForwardEvent, StopReason};
pub use port::is_port_in_use;
pub use registry::{Confirmation, ForwardRegistry, SessionRef};
pub use rule::ForwardRule;
pub use session::{ForwardSession, SessionState};
pub use splice::{join, splice, SpliceHandle, SpliceOptions, SpliceReport, SpliceStats};

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Forwarding errors
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to {target}")]
    DialTimeout { target: String },

    #[error("Stream error: {0}")]
    Stream(#[source] io::Error),

    #[error("Forward already active: {0}")]
    AlreadyExists(ForwardRule),

    #[error("Forward not found: {0}")]
    NotFound(ForwardRule),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Forward declined: {0}")]
    Declined(ForwardRule),

    #[error("Listener failed: {0}")]
    Listener(#[source] io::Error),
}

/// Default destination connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default grace period after one direction of a splice reaches end-of-stream
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-direction copy buffer (16 KB)
pub const DEFAULT_BUFFER_SIZE: usize = 16384;

/// Default number of concurrent splices per session
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Runtime tuning shared by every session of a registry
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    /// Timeout for dialing the destination of one accepted connection
    pub connect_timeout: Duration,
    /// Per-splice settings
    pub splice: SpliceOptions,
    /// Maximum concurrent splices per session
    pub max_connections: usize,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            splice: SpliceOptions::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}
