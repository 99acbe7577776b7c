//! Local port availability pre-flight check
//!
//! The answer is only a hint: another process can take the port between this
//! check and the real bind, so the session's own bind stays authoritative.

use std::io;
use tokio::net::TcpListener;
use tracing::debug;

/// Host the throwaway listener binds to
const PROBE_HOST: &str = "127.0.0.1";

/// Check whether `port` is already bound on the loopback interface.
///
/// Binds a throwaway listener and releases it immediately. Any bind failure
/// counts as "in use" so a broken check never reports a port as free.
pub async fn is_port_in_use(port: u16) -> bool {
    match TcpListener::bind((PROBE_HOST, port)).await {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => true,
        Err(e) => {
            debug!("Port probe on {}:{} failed: {}", PROBE_HOST, port, e);
            true
        }
    }
}
