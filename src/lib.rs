//! # portfwd
//!
//! A local TCP port-forwarding engine.
//!
//! Each forward rule binds a listening socket on a source endpoint and, for
//! every accepted connection, opens a connection to the destination endpoint
//! and relays bytes in both directions until either side finishes.
//!
//! ## Features
//!
//! - **Independent sessions**: one listener per rule, many concurrent rules
//! - **Half-close aware splicing** with a bounded drain period
//! - **Structured rule identity**: add, remove and replay by the full 4-tuple
//! - **Lifecycle events** for observers (ready, accepted, closed, stopped)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    CLI / Intents                     │
//! │          ("8080/add", config file, prompts)          │
//! ├─────────────────────────────────────────────────────┤
//! │                  ForwardRegistry                     │
//! │        (rule -> session, add/remove/replay)          │
//! ├─────────────────────────────────────────────────────┤
//! │                  ForwardSession                      │
//! │        (listener, accept loop, state machine)        │
//! ├─────────────────────────────────────────────────────┤
//! │                     Splice                           │
//! │        (bidirectional copy, half-close, drain)       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod forward;
pub mod intent;

pub use config::Config;
pub use forward::{
    ForwardError, ForwardEvent, ForwardOptions, ForwardRegistry, ForwardRule, ForwardSession,
    SessionState,
};
pub use intent::{parse_intent, IntentError, RuleAction, RuleIntent};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Forward error: {0}")]
    Forward(#[from] forward::ForwardError),

    #[error("Configuration error: {0}")]
    Config(String),
}
