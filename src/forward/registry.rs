//! Registry of forwarding sessions
//!
//! Holds one session per rule identity. The map is the only state shared
//! across sessions and is guarded by an async mutex. `add` keeps the lock
//! across the bind; stopping sessions happens outside it.

use super::{
    is_port_in_use, ForwardError, ForwardEvent, ForwardOptions, ForwardRule, ForwardSession,
    SessionState,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Capacity of the registry-wide event channel
const EVENT_CAPACITY: usize = 1024;

/// Shared reference to a registered session
pub type SessionRef = Arc<ForwardSession>;

/// Asks the user (or a policy) whether a forward may start.
///
/// Consulted before anything is bound; the core never waits on it once a
/// session is running.
#[async_trait]
pub trait Confirmation: Send + Sync {
    /// Return `true` to start forwarding `rule`
    async fn confirm(&self, rule: &ForwardRule) -> bool;
}

type SessionMap = HashMap<ForwardRule, SessionRef>;

/// Set of forwarding sessions indexed by rule identity
pub struct ForwardRegistry {
    sessions: Arc<Mutex<SessionMap>>,
    options: ForwardOptions,
    events: broadcast::Sender<ForwardEvent>,
}

impl ForwardRegistry {
    /// Create an empty registry
    pub fn new(options: ForwardOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            options,
            events,
        }
    }

    /// Subscribe to events of every session in the registry
    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.events.subscribe()
    }

    /// Register and start a forward.
    ///
    /// Fails with [`ForwardError::AlreadyExists`] if the rule is already
    /// listening, and with [`ForwardError::Bind`] if another session owns the
    /// source port or the bind fails. On failure the registry is unchanged.
    pub async fn add(&self, rule: ForwardRule) -> Result<SessionRef, ForwardError> {
        rule.validate()?;

        // Held across the bind so concurrent adds see a consistent map
        let mut sessions = self.sessions.lock().await;

        let existing = sessions.get(&rule).cloned();
        if let Some(ref session) = existing {
            if session.state().is_active() {
                return Err(ForwardError::AlreadyExists(rule));
            }
        }
        if let Some(owner) = port_owner(&sessions, &rule) {
            return Err(port_in_use(&rule, format!("source port owned by {}", owner)));
        }
        if probes_apply(&rule) && is_port_in_use(rule.source_port).await {
            debug!("Pre-flight check reports port {} in use", rule.source_port);
            return Err(port_in_use(&rule, "port is already in use".to_string()));
        }

        let session = existing.unwrap_or_else(|| self.create_session(rule.clone()));
        session.start().await?;

        if sessions.insert(rule, Arc::clone(&session)).is_none() {
            self.watch_failure(&session);
        }
        Ok(session)
    }

    /// Ask `confirmation` first, then [`add`](Self::add).
    ///
    /// A refusal returns [`ForwardError::Declined`] without touching the
    /// registry.
    pub async fn add_confirmed(
        &self,
        rule: ForwardRule,
        confirmation: &dyn Confirmation,
    ) -> Result<SessionRef, ForwardError> {
        rule.validate()?;
        if !confirmation.confirm(&rule).await {
            info!("Forward {} declined", rule);
            return Err(ForwardError::Declined(rule));
        }
        self.add(rule).await
    }

    /// Register a rule without starting it (e.g. when loading stored rules).
    ///
    /// The session stays idle until [`replay_all`](Self::replay_all).
    pub async fn register(&self, rule: ForwardRule) -> Result<SessionRef, ForwardError> {
        rule.validate()?;

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&rule) {
            return Err(ForwardError::AlreadyExists(rule));
        }

        let session = self.create_session(rule.clone());
        sessions.insert(rule, Arc::clone(&session));
        drop(sessions);

        self.watch_failure(&session);
        Ok(session)
    }

    /// Stop a forward and drop it from the registry
    pub async fn remove(&self, rule: &ForwardRule) -> Result<(), ForwardError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(rule)
            .ok_or_else(|| ForwardError::NotFound(rule.clone()))?;

        session.stop().await;
        info!("Removed forward {}", rule);
        Ok(())
    }

    /// Get a registered session
    pub async fn get(&self, rule: &ForwardRule) -> Option<SessionRef> {
        self.sessions.lock().await.get(rule).cloned()
    }

    /// Snapshot of every registered rule and its state
    pub async fn list(&self) -> Vec<(ForwardRule, SessionState)> {
        let sessions = self.sessions.lock().await;
        let mut entries: Vec<_> = sessions
            .iter()
            .map(|(rule, session)| (rule.clone(), session.state()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Number of registered rules
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Check if no rule is registered
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Start every idle or stopped session.
    ///
    /// Each rule is started independently; one failure does not prevent the
    /// others from starting.
    pub async fn replay_all(&self) -> Vec<(ForwardRule, Result<SocketAddr, ForwardError>)> {
        let pending: Vec<SessionRef> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|session| {
                matches!(session.state(), SessionState::Idle | SessionState::Stopped)
            })
            .cloned()
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        for session in pending {
            let result = session.start().await;
            if let Err(ref e) = result {
                warn!("Failed to start forward {}: {}", session.rule(), e);
            }
            results.push((session.rule().clone(), result));
        }
        results
    }

    /// Stop every session, keeping the rules registered
    pub async fn shutdown(&self) {
        let sessions: Vec<SessionRef> = self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            session.stop().await;
        }
    }

    fn create_session(&self, rule: ForwardRule) -> SessionRef {
        Arc::new(ForwardSession::with_events(
            rule,
            self.options.clone(),
            self.events.clone(),
        ))
    }

    /// Drop the entry once its session fails.
    ///
    /// Holds only a weak reference so a removed session is not kept alive.
    fn watch_failure(&self, session: &SessionRef) {
        let mut state = session.subscribe_state();
        let weak: Weak<ForwardSession> = Arc::downgrade(session);
        let sessions = Arc::clone(&self.sessions);
        let rule = session.rule().clone();

        tokio::spawn(async move {
            // Errors once the session (and its state sender) is dropped
            if state.wait_for(|s| *s == SessionState::Failed).await.is_err() {
                return;
            }
            let Some(session) = weak.upgrade() else {
                return;
            };

            let mut sessions = sessions.lock().await;
            // A concurrent add may have restarted it in the meantime
            if session.state() == SessionState::Failed
                && sessions
                    .get(&rule)
                    .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                sessions.remove(&rule);
                match session.failure() {
                    Some(e) => warn!("Forward {} removed after failure: {}", rule, e),
                    None => warn!("Forward {} failed and was removed", rule),
                }
            }
        });
    }
}

/// Bind error reported without touching the socket layer
fn port_in_use(rule: &ForwardRule, reason: String) -> ForwardError {
    ForwardError::Bind {
        addr: rule.listen_addr(),
        source: io::Error::new(io::ErrorKind::AddrInUse, reason),
    }
}

/// The loopback probe only says something about loopback or wildcard binds
fn probes_apply(rule: &ForwardRule) -> bool {
    matches!(
        rule.source_host.as_str(),
        "" | "0.0.0.0" | "127.0.0.1" | "localhost"
    )
}

/// Another active session listening on the same source port
fn port_owner<'a>(sessions: &'a SessionMap, rule: &ForwardRule) -> Option<&'a ForwardRule> {
    sessions
        .iter()
        .find(|(other, session)| {
            *other != rule
                && other.source_port == rule.source_port
                && session.state().is_active()
        })
        .map(|(other, _)| other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct Answer(bool);

    #[async_trait]
    impl Confirmation for Answer {
        async fn confirm(&self, _rule: &ForwardRule) -> bool {
            self.0
        }
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_add_list_remove() {
        let registry = ForwardRegistry::new(ForwardOptions::default());
        let rule = ForwardRule::new("127.0.0.1", free_port().await, "127.0.0.1", 9);

        let session = registry.add(rule.clone()).await.unwrap();
        assert_eq!(session.state(), SessionState::Listening);
        assert_eq!(
            registry.list().await,
            vec![(rule.clone(), SessionState::Listening)]
        );

        registry.remove(&rule).await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(registry.is_empty().await);

        let err = registry.remove(&rule).await.unwrap_err();
        assert!(matches!(err, ForwardError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_add_duplicate_is_rejected() {
        let registry = ForwardRegistry::new(ForwardOptions::default());
        let rule = ForwardRule::new("127.0.0.1", free_port().await, "127.0.0.1", 9);

        let first = registry.add(rule.clone()).await.unwrap();
        let err = registry.add(rule.clone()).await.unwrap_err();
        assert!(matches!(err, ForwardError::AlreadyExists(_)));
        assert_eq!(registry.len().await, 1);
        assert_eq!(first.state(), SessionState::Listening);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_on_owned_port_leaves_registry_unchanged() {
        let registry = ForwardRegistry::new(ForwardOptions::default());
        let port = free_port().await;
        let rule = ForwardRule::new("127.0.0.1", port, "127.0.0.1", 9);
        let other = ForwardRule::new("127.0.0.1", port, "127.0.0.1", 10);

        registry.add(rule.clone()).await.unwrap();
        let err = registry.add(other.clone()).await.unwrap_err();
        assert!(matches!(err, ForwardError::Bind { .. }));
        assert_eq!(
            registry.list().await,
            vec![(rule.clone(), SessionState::Listening)]
        );

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_not_registered() {
        let registry = ForwardRegistry::new(ForwardOptions::default());
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = registry
            .add(ForwardRule::new("127.0.0.1", port, "127.0.0.1", 9))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Bind { .. }));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_confirmed() {
        let registry = ForwardRegistry::new(ForwardOptions::default());
        let rule = ForwardRule::new("127.0.0.1", free_port().await, "127.0.0.1", 9);

        let err = registry
            .add_confirmed(rule.clone(), &Answer(false))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Declined(_)));
        assert!(registry.is_empty().await);

        registry
            .add_confirmed(rule.clone(), &Answer(true))
            .await
            .unwrap();
        assert_eq!(registry.len().await, 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_then_replay() {
        let registry = ForwardRegistry::new(ForwardOptions::default());
        let first = ForwardRule::new("127.0.0.1", free_port().await, "127.0.0.1", 9);
        let second = ForwardRule::new("127.0.0.1", free_port().await, "127.0.0.1", 9);

        registry.register(first.clone()).await.unwrap();
        registry.register(second.clone()).await.unwrap();
        assert!(matches!(
            registry.register(first.clone()).await,
            Err(ForwardError::AlreadyExists(_))
        ));
        assert!(registry
            .list()
            .await
            .iter()
            .all(|(_, state)| *state == SessionState::Idle));

        let results = registry.replay_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, result)| result.is_ok()));

        // Stopped sessions are replayed again, listening ones are left alone
        registry.get(&first).await.unwrap().stop().await;
        let results = registry.replay_all().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, first);

        registry.shutdown().await;
        assert!(registry
            .list()
            .await
            .iter()
            .all(|(_, state)| *state == SessionState::Stopped));
    }

    #[tokio::test]
    async fn test_add_restarts_stopped_session() {
        let registry = ForwardRegistry::new(ForwardOptions::default());
        let rule = ForwardRule::new("127.0.0.1", free_port().await, "127.0.0.1", 9);

        let session = registry.add(rule.clone()).await.unwrap();
        session.stop().await;

        let again = registry.add(rule.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&session, &again));
        assert_eq!(again.state(), SessionState::Listening);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_loop_is_rejected() {
        let registry = ForwardRegistry::new(ForwardOptions::default());
        let port = free_port().await;

        let err = registry
            .add(ForwardRule::new("127.0.0.1", port, "localhost", port))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::InvalidRule(_)));
        assert!(registry.is_empty().await);
    }

    async fn wait_until_unregistered(registry: &ForwardRegistry, rule: &ForwardRule) -> bool {
        for _ in 0..200 {
            if registry.get(rule).await.is_none() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_failed_session_is_removed() {
        let registry = ForwardRegistry::new(ForwardOptions::default());
        let rule = ForwardRule::new("127.0.0.1", free_port().await, "127.0.0.1", 9);

        let session = registry.add(rule.clone()).await.unwrap();
        session.inject_listener_failure(io::Error::new(io::ErrorKind::Other, "listener closed"));

        assert!(wait_until_unregistered(&registry, &rule).await);
        assert!(registry.list().await.is_empty());

        // Releases the port; a fresh session for the same rule stays registered
        session.stop().await;
        let fresh = registry.add(rule.clone()).await.unwrap();
        assert!(!Arc::ptr_eq(&session, &fresh));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(
            registry.list().await,
            vec![(rule.clone(), SessionState::Listening)]
        );

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_restarted_before_removal_is_kept() {
        let registry = ForwardRegistry::new(ForwardOptions::default());
        let rule = ForwardRule::new("127.0.0.1", free_port().await, "127.0.0.1", 9);
        let session = registry.add(rule.clone()).await.unwrap();

        {
            // Hold the map so the watcher sees the failure but cannot act yet
            let _sessions = registry.sessions.lock().await;
            session.inject_listener_failure(io::Error::new(io::ErrorKind::Other, "listener closed"));
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;

            session.start().await.unwrap();
            assert_eq!(session.state(), SessionState::Listening);
        }

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let kept = registry.get(&rule).await.unwrap();
        assert!(Arc::ptr_eq(&kept, &session));
        assert_eq!(kept.state(), SessionState::Listening);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_rule_is_rejected() {
        let registry = ForwardRegistry::new(ForwardOptions::default());
        let err = registry
            .add(ForwardRule::new("127.0.0.1", 0, "127.0.0.1", 9))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::InvalidRule(_)));
        assert!(registry.is_empty().await);
    }
}
