//! Forwarding session
//!
//! One session owns the listener of one rule and every splice spawned from
//! it. Lifecycle:
//!
//! ```text
//! Idle ──start()──▶ Listening ──stop()──▶ Cancelling ──▶ Stopped
//!                       │                                  ▲
//!                       └──listener error──▶ Failed ──stop()┘
//! ```
//!
//! A stopped or failed session can be started again.

use super::{
    dial, join, ForwardError, ForwardEvent, ForwardOptions, ForwardRule, SpliceHandle,
    SpliceReport, StopReason,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacity of a session's own event channel
const EVENT_CAPACITY: usize = 256;

/// Back-off after the process runs out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, never started
    Idle,
    /// Listener bound and accepting
    Listening,
    /// Stop requested, tearing down splices
    Cancelling,
    /// Listener closed and every splice torn down
    Stopped,
    /// Listener failed; splices torn down
    Failed,
}

impl SessionState {
    /// Whether the session currently owns its source port
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Listening | SessionState::Cancelling)
    }
}

/// State shared between the session and its accept loop
#[derive(Debug)]
struct Shared {
    rule: ForwardRule,
    options: ForwardOptions,
    events: broadcast::Sender<ForwardEvent>,
    state: watch::Sender<SessionState>,
    failure: watch::Sender<Option<Arc<ForwardError>>>,
    active: AtomicUsize,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// Record a listener failure, then enter `Failed`
    fn fail(&self, error: io::Error) -> StopReason {
        let error = ForwardError::Listener(error);
        error!("Forward {} failed: {}", self.rule, error);
        let reason = StopReason::Failed(error.to_string());
        self.failure.send_replace(Some(Arc::new(error)));
        self.set_state(SessionState::Failed);
        reason
    }

    fn emit(&self, event: ForwardEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Accept loop of a started session
#[derive(Debug)]
struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Runtime instance of one forward rule
#[derive(Debug)]
pub struct ForwardSession {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ForwardSession {
    /// Create an idle session with its own event channel
    pub fn new(rule: ForwardRule, options: ForwardOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(rule, options, events)
    }

    /// Create an idle session publishing on an existing event channel
    pub fn with_events(
        rule: ForwardRule,
        options: ForwardOptions,
        events: broadcast::Sender<ForwardEvent>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (failure, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                rule,
                options,
                events,
                state,
                failure,
                active: AtomicUsize::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    /// Get the forwarded rule
    pub fn rule(&self) -> &ForwardRule {
        &self.shared.rule
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to progress and terminal events
    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.shared.events.subscribe()
    }

    /// Number of splices currently relaying data
    pub fn active_splices(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Listener error that put the session in `Failed`, until the next start
    pub fn failure(&self) -> Option<Arc<ForwardError>> {
        self.shared.failure.borrow().clone()
    }

    /// Drive the session into `Failed` as a listener error would
    #[cfg(test)]
    pub(crate) fn inject_listener_failure(&self, error: io::Error) {
        self.shared.fail(error);
    }

    /// Address the listener is bound to, while started
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|run| run.local_addr)
    }

    /// Bind the source address and start accepting connections.
    ///
    /// The bind is the authoritative availability check: a taken port fails
    /// with [`ForwardError::Bind`] and leaves the state unchanged.
    pub async fn start(&self) -> Result<SocketAddr, ForwardError> {
        let rule = &self.shared.rule;
        let mut running = self.running.lock().await;

        if let Some(previous) = running.take() {
            if self.state() == SessionState::Listening {
                *running = Some(previous);
                return Err(ForwardError::AlreadyExists(rule.clone()));
            }
            // Failed earlier and never stopped; reap the finished loop
            previous.cancel.cancel();
            if let Err(e) = previous.task.await {
                debug!("Forward {} previous accept loop ended abnormally: {}", rule, e);
            }
        }

        rule.validate()?;

        let addr = rule.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ForwardError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ForwardError::Bind { addr, source })?;

        let cancel = CancellationToken::new();
        self.shared.failure.send_replace(None);
        self.shared.set_state(SessionState::Listening);
        info!("Forwarding {} (listening on {})", rule, local_addr);
        self.shared.emit(ForwardEvent::Ready {
            rule: rule.clone(),
            local_addr,
        });

        let task = tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            cancel.clone(),
        ));

        *running = Some(Running {
            cancel,
            task,
            local_addr,
        });

        Ok(local_addr)
    }

    /// Close the listener and tear down every in-flight splice.
    ///
    /// Returns once all connections of the session are closed. Calling it on
    /// a session that is not running is a no-op.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return;
        };

        self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Listening {
                *state = SessionState::Cancelling;
                true
            } else {
                false
            }
        });
        debug!("Stopping forward {}", self.shared.rule);

        run.cancel.cancel();
        if let Err(e) = run.task.await {
            error!("Forward {} accept loop ended abnormally: {}", self.shared.rule, e);
        }

        self.shared.set_state(SessionState::Stopped);
    }
}

impl Drop for ForwardSession {
    fn drop(&mut self) {
        // Make sure an abandoned session releases its port and connections
        if let Some(run) = self.running.get_mut().take() {
            run.cancel.cancel();
        }
    }
}

/// A dialed connection pair waiting to be spliced
struct Pending {
    connection: u64,
    source: TcpStream,
    destination: TcpStream,
    permit: OwnedSemaphorePermit,
}

/// A splice owned by the accept loop
struct ActiveSplice {
    handle: SpliceHandle,
    _permit: OwnedSemaphorePermit,
}

/// Accept connections until cancelled or the listener fails, then tear down
async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, cancel: CancellationToken) {
    let rule = shared.rule.clone();
    let limit = Arc::new(Semaphore::new(shared.options.max_connections.max(1)));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<SpliceReport>();
    let mut dials: JoinSet<Option<Pending>> = JoinSet::new();
    let mut splices: HashMap<u64, ActiveSplice> = HashMap::new();
    let mut connections: u64 = 0;

    let failure = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break None;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let permit = match Arc::clone(&limit).try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!("Forward {} at connection limit, dropping {}", rule, peer);
                                shared.emit(ForwardEvent::Rejected { rule: rule.clone(), peer });
                                continue;
                            }
                        };

                        connections += 1;
                        debug!("Forward {} accepted connection {} from {}", rule, connections, peer);
                        shared.emit(ForwardEvent::Accepted {
                            rule: rule.clone(),
                            connection: connections,
                            peer,
                        });

                        dials.spawn(connect_destination(
                            Arc::clone(&shared),
                            connections,
                            stream,
                            permit,
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => match classify_accept_error(&e) {
                        AcceptAction::Retry => {
                            debug!("Forward {} accept error: {}", rule, e);
                        }
                        AcceptAction::Backoff => {
                            warn!("Forward {} accept error: {}", rule, e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                        AcceptAction::Fail => break Some(e),
                    },
                }
            }
            Some(joined) = dials.join_next() => {
                match joined {
                    Ok(Some(pending)) => {
                        let handle = join(
                            pending.connection,
                            pending.source,
                            pending.destination,
                            shared.options.splice.clone(),
                            cancel.child_token(),
                            done_tx.clone(),
                        );
                        splices.insert(
                            pending.connection,
                            ActiveSplice { handle, _permit: pending.permit },
                        );
                        shared.active.store(splices.len(), Ordering::Relaxed);
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Forward {} dial task ended abnormally: {}", rule, e),
                }
            }
            Some(report) = done_rx.recv() => {
                if let Some(active) = splices.remove(&report.id) {
                    trace!(
                        "Forward {} connection {} open for {:?}",
                        rule,
                        report.id,
                        active.handle.started_at().elapsed()
                    );
                }
                shared.active.store(splices.len(), Ordering::Relaxed);

                let (stats, error) = match report.result {
                    Ok(stats) => {
                        debug!(
                            "Forward {} connection {} closed ({} bytes out, {} bytes in)",
                            rule, report.id, stats.bytes_to_destination, stats.bytes_to_source
                        );
                        (stats, None)
                    }
                    Err(e) => {
                        debug!("Forward {} connection {} failed: {}", rule, report.id, e);
                        (Default::default(), Some(e.to_string()))
                    }
                };
                shared.emit(ForwardEvent::SpliceClosed {
                    rule: rule.clone(),
                    connection: report.id,
                    stats,
                    error,
                });
            }
        }
    };

    // No further accepts
    drop(listener);

    // Child tokens of every pending dial and splice fire together
    cancel.cancel();
    dials.shutdown().await;
    let in_flight = splices.len();
    for (_, active) in splices.drain() {
        active.handle.closed().await;
    }
    shared.active.store(0, Ordering::Relaxed);
    if in_flight > 0 {
        debug!("Forward {} tore down {} connection(s)", rule, in_flight);
    }

    let reason = match failure {
        None => {
            shared.set_state(SessionState::Stopped);
            info!("Forward {} stopped", rule);
            StopReason::Cancelled
        }
        Some(e) => shared.fail(e),
    };
    shared.emit(ForwardEvent::Stopped { rule, reason });
}

/// Dial the destination for one accepted connection.
///
/// On failure the source connection is dropped (closed) here and the session
/// keeps accepting.
async fn connect_destination(
    shared: Arc<Shared>,
    connection: u64,
    source: TcpStream,
    permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) -> Option<Pending> {
    let rule = &shared.rule;
    let target = rule.destination_addr();

    let dialed = tokio::select! {
        _ = cancel.cancelled() => return None,
        result = dial(&target, shared.options.connect_timeout) => result,
    };

    match dialed {
        Ok(destination) => {
            source.set_nodelay(true).ok();
            trace!("Forward {} connection {} connected to {}", rule, connection, target);
            Some(Pending {
                connection,
                source,
                destination,
                permit,
            })
        }
        Err(e) => {
            warn!("Forward {} connection {} dropped: {}", rule, connection, e);
            shared.emit(ForwardEvent::DialFailed {
                rule: rule.clone(),
                connection,
                error: e.to_string(),
            });
            None
        }
    }
}

/// What the accept loop does after `accept()` fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptAction {
    /// Only the connection being accepted is affected
    Retry,
    /// Out of descriptors (ENFILE / EMFILE); retry after a pause
    Backoff,
    /// The listener itself is broken
    Fail,
}

fn classify_accept_error(e: &io::Error) -> AcceptAction {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => AcceptAction::Retry,
        _ if matches!(e.raw_os_error(), Some(23) | Some(24)) => AcceptAction::Backoff,
        _ => AcceptAction::Fail,
    }
}
