//! Process-wide table of active sessions.
//!
//! The registry only holds queue handles: it never owns a socket. Broadcast
//! works on a snapshot of the table, so sessions may register or leave while a
//! broadcast is in progress. A target whose queue is full or closed is removed,
//! its session is cancelled, and the broadcast carries on with the others.

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::messages::DeviceOutbound;
use crate::core::provider::ProviderCommand;

/// Size of each session's outbound device queue.
pub const DEVICE_QUEUE_SIZE: usize = 256;

/// Work items for a session's device writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceRoute {
    Outgoing(DeviceOutbound),
    /// Raw PCM written as a binary frame.
    Audio(Bytes),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Device with its own provider channel.
    Relay,
    /// AR device feeding events into another session's conversation.
    Observer,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Relay => write!(f, "relay"),
            SessionKind::Observer => write!(f, "observer"),
        }
    }
}

/// Non-owning handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub call_id: String,
    pub kind: SessionKind,
    pub device: mpsc::Sender<DeviceRoute>,
    pub provider: Option<mpsc::Sender<ProviderCommand>>,
    /// Relay whose conversation an observer follows.
    pub observer_target: Option<String>,
    /// Ends the owning session when the registry drops it.
    pub cancel: Option<CancellationToken>,
    pub created_at: SystemTime,
}

impl SessionHandle {
    pub fn new(call_id: impl Into<String>, kind: SessionKind, device: mpsc::Sender<DeviceRoute>) -> Self {
        Self {
            call_id: call_id.into(),
            kind,
            device,
            provider: None,
            observer_target: None,
            cancel: None,
            created_at: SystemTime::now(),
        }
    }

    pub fn with_observer_target(mut self, target: Option<String>) -> Self {
        self.observer_target = target;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancel_session(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }

    /// Queue a message without waiting. `false` when full or closed.
    pub fn send(&self, message: DeviceOutbound) -> bool {
        match self.device.try_send(DeviceRoute::Outgoing(message)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(call_id = %self.call_id, "Device queue full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(call_id = %self.call_id, "Device queue closed");
                false
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session {0} is already active")]
    AlreadyRegistered(String),
}

/// Read-only view of one registered session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub call_id: String,
    pub kind: SessionKind,
    pub provider_attached: bool,
    #[serde(skip)]
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: Vec<String>,
}

/// Thread-safe via Arc + DashMap. Clone shares the table.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. A call id can only be registered once at a time.
    pub fn register(&self, handle: SessionHandle) -> Result<(), RegistryError> {
        match self.sessions.entry(handle.call_id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(handle.call_id)),
            Entry::Vacant(slot) => {
                tracing::debug!(call_id = %handle.call_id, kind = %handle.kind, "Session registered");
                slot.insert(handle);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, call_id: &str) -> Option<SessionHandle> {
        let removed = self.sessions.remove(call_id).map(|(_, handle)| handle);
        if removed.is_some() {
            tracing::debug!(call_id, "Session unregistered");
        }
        removed
    }

    /// Remove `call_id` only if it still refers to the queue `device`, so a
    /// closing session never evicts a newer one that reused its id.
    pub fn unregister_if_same(&self, call_id: &str, device: &mpsc::Sender<DeviceRoute>) -> bool {
        let removed = self
            .sessions
            .remove_if(call_id, |_, handle| handle.device.same_channel(device))
            .is_some();
        if removed {
            tracing::debug!(call_id, "Session unregistered");
        }
        removed
    }

    /// Record the provider queue of a relay session once its channel is open.
    pub fn attach_provider(&self, call_id: &str, provider: mpsc::Sender<ProviderCommand>) -> bool {
        match self.sessions.get_mut(call_id) {
            Some(mut handle) => {
                handle.provider = Some(provider);
                true
            }
            None => false,
        }
    }

    pub fn detach_provider(&self, call_id: &str) {
        if let Some(mut handle) = self.sessions.get_mut(call_id) {
            handle.provider = None;
        }
    }

    /// Provider queue for `target`, or of the oldest session with an open
    /// provider channel when no target is given.
    pub fn provider_for(&self, target: Option<&str>) -> Option<(String, mpsc::Sender<ProviderCommand>)> {
        if let Some(target) = target {
            return self.sessions.get(target).and_then(|handle| {
                handle
                    .provider
                    .as_ref()
                    .filter(|tx| !tx.is_closed())
                    .map(|tx| (handle.call_id.clone(), tx.clone()))
            });
        }
        self.sessions
            .iter()
            .filter_map(|entry| {
                let handle = entry.value();
                handle
                    .provider
                    .as_ref()
                    .filter(|tx| !tx.is_closed())
                    .map(|tx| (handle.created_at, handle.call_id.clone(), tx.clone()))
            })
            .min_by_key(|(created_at, _, _)| *created_at)
            .map(|(_, call_id, tx)| (call_id, tx))
    }

    pub fn get(&self, call_id: &str) -> Option<SessionHandle> {
        self.sessions.get(call_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.sessions.contains_key(call_id)
    }

    /// Send to every session except `exclude`. Targets that cannot accept the
    /// message are unregistered.
    pub fn broadcast(&self, message: &DeviceOutbound, exclude: Option<&str>) -> BroadcastReport {
        self.broadcast_where(message, exclude, |_| true)
    }

    /// Mirror a relay's provider traffic to the observers following it: those
    /// targeting `relay_call_id`, and untargeted ones when it is the relay
    /// [`provider_for(None)`](Self::provider_for) resolves to.
    pub fn mirror_to_observers(&self, relay_call_id: &str, message: &DeviceOutbound) -> BroadcastReport {
        let default_relay = self.provider_for(None).map(|(call_id, _)| call_id);
        let follows = |handle: &SessionHandle| match handle.observer_target.as_deref() {
            Some(target) => target == relay_call_id,
            None => default_relay.as_deref() == Some(relay_call_id),
        };
        self.broadcast_where(message, Some(relay_call_id), |handle| {
            handle.kind == SessionKind::Observer && follows(handle)
        })
    }

    fn broadcast_where<F>(&self, message: &DeviceOutbound, exclude: Option<&str>, include: F) -> BroadcastReport
    where
        F: Fn(&SessionHandle) -> bool,
    {
        let targets: Vec<SessionHandle> = self
            .sessions
            .iter()
            .filter(|entry| Some(entry.key().as_str()) != exclude && include(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        let mut report = BroadcastReport::default();
        for target in targets {
            if target.send(message.clone()) {
                report.delivered += 1;
            } else if self.unregister_if_same(&target.call_id, &target.device) {
                target.cancel_session();
                tracing::info!(call_id = %target.call_id, "Removed unreachable session during broadcast");
                report.removed.push(target.call_id);
            }
        }
        tracing::debug!(
            msg_type = message.type_name(),
            delivered = report.delivered,
            removed = report.removed.len(),
            "Broadcast complete"
        );
        report
    }

    /// Ask every session to close and empty the table. Returns how many were
    /// asked.
    pub fn close_all(&self) -> usize {
        let targets: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for target in &targets {
            let _ = target.device.try_send(DeviceRoute::Close);
            self.unregister_if_same(&target.call_id, &target.device);
            target.cancel_session();
        }
        targets.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn count(&self, kind: SessionKind) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().kind == kind)
            .count()
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let handle = entry.value();
                SessionSummary {
                    call_id: handle.call_id.clone(),
                    kind: handle.kind,
                    provider_attached: handle.provider.as_ref().is_some_and(|tx| !tx.is_closed()),
                    created_at: handle.created_at,
                }
            })
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(registry: &SessionRegistry, id: &str) -> mpsc::Receiver<DeviceRoute> {
        let (tx, rx) = mpsc::channel(8);
        registry
            .register(SessionHandle::new(id, SessionKind::Relay, tx))
            .unwrap();
        rx
    }

    #[test]
    fn test_register_rejects_duplicate_call_id() {
        let registry = SessionRegistry::new();
        let _rx = session(&registry, "call-1");
        let (tx, _rx2) = mpsc::channel(1);
        let err = registry
            .register(SessionHandle::new("call-1", SessionKind::Relay, tx))
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered("call-1".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_skips_closed_and_unregisters_it() {
        let registry = SessionRegistry::new();
        let mut a = session(&registry, "a");
        let mut b = session(&registry, "b");
        let closed = session(&registry, "c");
        drop(closed);

        let report = registry.broadcast(&DeviceOutbound::info("hello"), None);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.removed, vec!["c".to_string()]);
        assert!(!registry.contains("c"));
        assert_eq!(registry.len(), 2);

        let expected = DeviceRoute::Outgoing(DeviceOutbound::info("hello"));
        assert_eq!(a.try_recv().unwrap(), expected);
        assert_eq!(b.try_recv().unwrap(), expected);
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let registry = SessionRegistry::new();
        let mut a = session(&registry, "a");
        let mut b = session(&registry, "b");

        let report = registry.broadcast(&DeviceOutbound::Ping, Some("a"));
        assert_eq!(report.delivered, 1);
        assert!(a.try_recv().is_err());
        assert_eq!(b.try_recv().unwrap(), DeviceRoute::Outgoing(DeviceOutbound::Ping));
    }

    #[test]
    fn test_full_queue_counts_as_failure() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry
            .register(SessionHandle::new("slow", SessionKind::Observer, tx))
            .unwrap();

        assert_eq!(registry.broadcast(&DeviceOutbound::Ping, None).delivered, 1);
        let report = registry.broadcast(&DeviceOutbound::Ping, None);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.removed, vec!["slow".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_evicted_session_is_cancelled() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        registry
            .register(SessionHandle::new("stalled", SessionKind::Relay, tx).with_cancel(cancel.clone()))
            .unwrap();

        registry.broadcast(&DeviceOutbound::Ping, None);
        assert!(!cancel.is_cancelled());
        let report = registry.broadcast(&DeviceOutbound::Ping, None);
        assert_eq!(report.removed, vec!["stalled".to_string()]);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_close_all_cancels_sessions() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        registry
            .register(SessionHandle::new("a", SessionKind::Relay, tx).with_cancel(cancel.clone()))
            .unwrap();
        assert_eq!(registry.close_all(), 1);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_mirror_reaches_only_following_observers() {
        let registry = SessionRegistry::new();
        let (a_tx, _a) = mpsc::channel(4);
        let mut relay_a = SessionHandle::new("relay-a", SessionKind::Relay, a_tx);
        relay_a.created_at = SystemTime::UNIX_EPOCH;
        registry.register(relay_a).unwrap();
        let _b = session(&registry, "relay-b");
        let (provider_a, _provider_a_rx) = mpsc::channel(1);
        let (provider_b, _provider_b_rx) = mpsc::channel(1);
        registry.attach_provider("relay-a", provider_a);
        registry.attach_provider("relay-b", provider_b);

        let observer = |id: &str, target: Option<&str>| {
            let (tx, rx) = mpsc::channel(4);
            registry
                .register(
                    SessionHandle::new(id, SessionKind::Observer, tx)
                        .with_observer_target(target.map(str::to_string)),
                )
                .unwrap();
            rx
        };
        let mut on_a = observer("obs-a", Some("relay-a"));
        let mut on_b = observer("obs-b", Some("relay-b"));
        let mut untargeted = observer("obs-any", None);

        let message = DeviceOutbound::VapiMessage {
            data: serde_json::json!({"type": "transcript", "text": "secret"}),
        };
        let report = registry.mirror_to_observers("relay-b", &message);
        assert_eq!(report.delivered, 1);
        assert_eq!(on_b.try_recv().unwrap(), DeviceRoute::Outgoing(message.clone()));
        assert!(on_a.try_recv().is_err());
        // Untargeted observers follow the oldest relay with a provider.
        assert!(untargeted.try_recv().is_err());

        let report = registry.mirror_to_observers("relay-a", &message);
        assert_eq!(report.delivered, 2);
        assert!(on_a.try_recv().is_ok());
        assert!(untargeted.try_recv().is_ok());
        assert!(on_b.try_recv().is_err());
    }

    #[test]
    fn test_provider_lookup() {
        let registry = SessionRegistry::new();
        let _a = session(&registry, "a");
        let _b = session(&registry, "b");
        assert!(registry.provider_for(None).is_none());

        let (provider_tx, _provider_rx) = mpsc::channel(4);
        assert!(registry.attach_provider("b", provider_tx));
        assert!(!registry.attach_provider("missing", mpsc::channel(1).0));

        let (call_id, _) = registry.provider_for(None).unwrap();
        assert_eq!(call_id, "b");
        assert!(registry.provider_for(Some("a")).is_none());
        assert_eq!(registry.provider_for(Some("b")).unwrap().0, "b");

        registry.detach_provider("b");
        assert!(registry.provider_for(None).is_none());
    }

    #[test]
    fn test_close_all_empties_table() {
        let registry = SessionRegistry::new();
        let mut a = session(&registry, "a");
        let _b = session(&registry, "b");
        assert_eq!(registry.count(SessionKind::Relay), 2);

        assert_eq!(registry.close_all(), 2);
        assert!(registry.is_empty());
        assert_eq!(a.try_recv().unwrap(), DeviceRoute::Close);
    }

    #[test]
    fn test_unregister_if_same_keeps_replacement() {
        let registry = SessionRegistry::new();
        let (old_tx, _old_rx) = mpsc::channel(1);
        registry
            .register(SessionHandle::new("x", SessionKind::Relay, old_tx.clone()))
            .unwrap();
        registry.unregister("x");
        let _new_rx = session(&registry, "x");

        assert!(!registry.unregister_if_same("x", &old_tx));
        assert!(registry.contains("x"));
    }
}
