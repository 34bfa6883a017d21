//! Authoritative in-memory map from session code to session record.
//!
//! Each session sits behind its own async mutex. Every mutation publishes its event to the
//! relay *before* that mutex is released, so for a single session the order in which the
//! registry applies changes is the order in which clients observe them. Sessions with
//! different codes never wait on each other.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};

use crate::relay::Relay;
use crate::sessions::code::{generate_session_code, is_valid_session_code, normalize_session_code};
use crate::sessions::error::SessionError;
use crate::sessions::model::{EndReason, Session, SessionEvent};

/// Attempts at drawing an unused random code before giving up.
const MAX_CODE_ATTEMPTS: usize = 20;

/// Registry tuning, usually taken from [`crate::config::Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Sessions untouched for longer than this are evicted.
    pub session_ttl: Duration,
    /// How often the eviction sweep runs.
    pub sweep_interval: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Result of a successful `join_session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub session: Session,
    /// `false` when the user was already a participant (nothing was published).
    pub newly_joined: bool,
}

/// Result of a successful `leave_session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// A participant left; the session lives on.
    Left,
    /// The host left and the session was torn down.
    Ended,
    /// The user was not a participant; nothing changed.
    NotMember,
}

#[derive(Debug)]
struct Slot {
    session: Session,
    /// Set under the lock when the session is torn down, for callers that fetched the slot
    /// before it left the map.
    ended: bool,
}

#[derive(Debug)]
struct Inner {
    sessions: DashMap<String, Arc<Mutex<Slot>>>,
    relay: Arc<dyn Relay>,
    settings: RegistrySettings,
    shutdown: watch::Sender<bool>,
}

/// Shared handle to the session registry. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    /// Build a registry without starting the expiry sweep.
    #[must_use]
    pub fn new(relay: Arc<dyn Relay>, settings: RegistrySettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                relay,
                settings,
                shutdown,
            }),
        }
    }

    /// Build a registry and spawn its idle-session sweep on the current runtime.
    ///
    /// The sweep stops on [`SessionRegistry::shutdown`] or once every handle is dropped.
    #[must_use]
    pub fn init(relay: Arc<dyn Relay>, settings: RegistrySettings) -> Self {
        let registry = Self::new(relay, settings);
        let weak = Arc::downgrade(&registry.inner);
        let shutdown = registry.inner.shutdown.subscribe();
        tokio::spawn(sweep_loop(weak, shutdown, settings.sweep_interval));

        tracing::info!(
            relay = %registry.inner.relay.kind(),
            ttl_secs = settings.session_ttl.as_secs(),
            sweep_secs = settings.sweep_interval.as_secs(),
            "Session registry started"
        );
        registry
    }

    /// The relay this registry publishes to.
    #[must_use]
    pub fn relay(&self) -> &Arc<dyn Relay> {
        &self.inner.relay
    }

    #[must_use]
    pub fn settings(&self) -> RegistrySettings {
        self.inner.settings
    }

    /// Create a session hosted by `host_id`.
    ///
    /// A random code is generated when `session_id` is `None`; a supplied code is normalized
    /// and must not collide with a live session.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Malformed`] if the supplied code is not 4-10 ASCII alphanumerics.
    /// - [`SessionError::Duplicate`] if the supplied code is in use.
    /// - [`SessionError::CodeSpaceExhausted`] if no free random code was found.
    pub async fn create_session(
        &self,
        host_id: &str,
        initial_state: Value,
        session_id: Option<&str>,
    ) -> Result<Session, SessionError> {
        let guard = match session_id {
            Some(requested) => {
                let code = normalize_session_code(requested);
                if !is_valid_session_code(&code) {
                    return Err(SessionError::Malformed(format!(
                        "'{requested}' is not a valid session code"
                    )));
                }
                self.try_reserve(code.clone(), host_id, initial_state)
                    .ok_or(SessionError::Duplicate(code))?
            }
            None => self.reserve_random(host_id, &initial_state)?,
        };

        let session = guard.session.clone();
        self.inner
            .relay
            .publish(SessionEvent::Created {
                session: session.clone(),
            })
            .await;
        drop(guard);

        tracing::info!(session_id = %session.session_id, host_id, "Session created");
        Ok(session)
    }

    /// Add `user_id` to a session's participants. Re-joining is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no live session has this code.
    pub async fn join_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<JoinOutcome, SessionError> {
        let code = normalize_session_code(session_id);
        let slot = self.slot(&code).ok_or_else(|| SessionError::NotFound(code.clone()))?;
        let mut guard = slot.lock().await;
        if guard.ended {
            return Err(SessionError::NotFound(code));
        }

        if !guard.session.participants.insert(user_id.to_string()) {
            tracing::debug!(session_id = %code, user_id, "User already joined");
            return Ok(JoinOutcome {
                session: guard.session.clone(),
                newly_joined: false,
            });
        }
        guard.session.touch();

        let session = guard.session.clone();
        self.inner
            .relay
            .publish(SessionEvent::ParticipantJoined {
                session: session.clone(),
                user_id: user_id.to_string(),
            })
            .await;
        drop(guard);

        tracing::info!(session_id = %code, user_id, "Participant joined");
        Ok(JoinOutcome {
            session,
            newly_joined: true,
        })
    }

    /// Replace a session's state wholesale.
    ///
    /// A missing session is logged and ignored, since updates can race with teardown.
    /// Returns whether the update was applied.
    pub async fn update_state(&self, session_id: &str, new_state: Value) -> bool {
        self.apply_state(session_id, None, new_state)
            .await
            .unwrap_or(false)
    }

    /// Replace a session's state on behalf of `user_id`, who must be a participant.
    ///
    /// Returns `Ok(false)` if the session no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotParticipant`] if `user_id` has not joined the session.
    pub async fn update_state_as(
        &self,
        session_id: &str,
        user_id: &str,
        new_state: Value,
    ) -> Result<bool, SessionError> {
        self.apply_state(session_id, Some(user_id), new_state).await
    }

    async fn apply_state(
        &self,
        session_id: &str,
        author: Option<&str>,
        new_state: Value,
    ) -> Result<bool, SessionError> {
        let code = normalize_session_code(session_id);
        let Some(slot) = self.slot(&code) else {
            tracing::debug!(session_id = %code, "State update for missing session dropped");
            return Ok(false);
        };
        let mut guard = slot.lock().await;
        if guard.ended {
            tracing::debug!(session_id = %code, "State update for ended session dropped");
            return Ok(false);
        }
        if let Some(user_id) = author
            && !guard.session.has_participant(user_id)
        {
            return Err(SessionError::NotParticipant {
                session_id: code,
                user_id: user_id.to_string(),
            });
        }

        guard.session.state = new_state;
        guard.session.touch();
        self.inner
            .relay
            .publish(SessionEvent::StateUpdated {
                session: guard.session.clone(),
            })
            .await;
        drop(guard);

        tracing::debug!(session_id = %code, "State updated");
        Ok(true)
    }

    /// Remove `user_id` from a session. The host leaving tears the whole session down.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no live session has this code.
    pub async fn leave_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<LeaveOutcome, SessionError> {
        let code = normalize_session_code(session_id);
        let slot = self.slot(&code).ok_or_else(|| SessionError::NotFound(code.clone()))?;
        let mut guard = slot.lock().await;
        if guard.ended {
            return Err(SessionError::NotFound(code));
        }

        if guard.session.is_host(user_id) {
            self.end_locked(&mut guard, EndReason::HostLeft).await;
            return Ok(LeaveOutcome::Ended);
        }

        if !guard.session.participants.remove(user_id) {
            return Ok(LeaveOutcome::NotMember);
        }
        guard.session.touch();

        self.inner
            .relay
            .publish(SessionEvent::ParticipantLeft {
                session: guard.session.clone(),
                user_id: user_id.to_string(),
            })
            .await;
        drop(guard);

        tracing::info!(session_id = %code, user_id, "Participant left");
        Ok(LeaveOutcome::Left)
    }

    /// Fetch a snapshot of a live session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] if no live session has this code.
    pub async fn get_session(&self, session_id: &str) -> Result<Session, SessionError> {
        let code = normalize_session_code(session_id);
        let slot = self.slot(&code).ok_or_else(|| SessionError::NotFound(code.clone()))?;
        let guard = slot.lock().await;
        if guard.ended {
            return Err(SessionError::NotFound(code));
        }
        Ok(guard.session.clone())
    }

    /// End every session idle for longer than the TTL, as of `now`. Returns the evicted codes.
    pub async fn expire_idle(&self, now: DateTime<Utc>) -> Vec<String> {
        let ttl = TimeDelta::from_std(self.inner.settings.session_ttl).unwrap_or(TimeDelta::MAX);
        let mut expired = Vec::new();

        for slot in self.snapshot_slots() {
            let mut guard = slot.lock().await;
            if guard.ended || now.signed_duration_since(guard.session.updated_at) <= ttl {
                continue;
            }
            expired.push(guard.session.session_id.clone());
            self.end_locked(&mut guard, EndReason::Expired).await;
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired idle sessions");
        }
        expired
    }

    /// Seed the registry with sessions recovered from storage, without publishing anything.
    ///
    /// Sessions whose code is already live are skipped. Returns how many were restored.
    pub fn restore(&self, sessions: Vec<Session>) -> usize {
        let mut restored = 0;
        for session in sessions {
            match self.inner.sessions.entry(session.session_id.clone()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::new(Mutex::new(Slot {
                        session,
                        ended: false,
                    })));
                    restored += 1;
                }
                Entry::Occupied(occupied) => {
                    tracing::warn!(session_id = %occupied.key(), "Skipping restore of live session");
                }
            }
        }
        if restored > 0 {
            tracing::info!(restored, "Restored sessions from storage");
        }
        restored
    }

    /// Stop the sweep and end every live session. Returns how many sessions were ended.
    pub async fn shutdown(&self) -> usize {
        self.inner.shutdown.send_replace(true);

        let mut ended = 0;
        for slot in self.snapshot_slots() {
            let mut guard = slot.lock().await;
            if guard.ended {
                continue;
            }
            self.end_locked(&mut guard, EndReason::Shutdown).await;
            ended += 1;
        }

        tracing::info!(ended, "Session registry shut down");
        ended
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    fn slot(&self, code: &str) -> Option<Arc<Mutex<Slot>>> {
        self.inner
            .sessions
            .get(code)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn snapshot_slots(&self) -> Vec<Arc<Mutex<Slot>>> {
        self.inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Insert a new slot under `code` if the code is free, returning it already locked so no
    /// other operation can observe the session before `Created` is published.
    fn try_reserve(
        &self,
        code: String,
        host_id: &str,
        initial_state: Value,
    ) -> Option<OwnedMutexGuard<Slot>> {
        let slot = Arc::new(Mutex::new(Slot {
            session: Session::new(code.clone(), host_id.to_string(), initial_state),
            ended: false,
        }));
        let guard = Arc::clone(&slot).try_lock_owned().ok()?;

        match self.inner.sessions.entry(code) {
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Some(guard)
            }
            Entry::Occupied(_) => None,
        }
    }

    fn reserve_random(
        &self,
        host_id: &str,
        initial_state: &Value,
    ) -> Result<OwnedMutexGuard<Slot>, SessionError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_session_code();
            if let Some(guard) = self.try_reserve(code, host_id, initial_state.clone()) {
                return Ok(guard);
            }
        }
        tracing::error!(host_id, "Session code space exhausted");
        Err(SessionError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
    }

    /// Tear down the locked session: mark it ended, drop it from the map and publish `Ended`.
    async fn end_locked(&self, slot: &mut Slot, reason: EndReason) {
        slot.ended = true;
        let code = slot.session.session_id.clone();
        self.inner.sessions.remove(&code);

        self.inner
            .relay
            .publish(SessionEvent::Ended {
                session: slot.session.clone(),
                reason,
            })
            .await;

        tracing::info!(session_id = %code, ?reason, "Session ended");
    }
}

async fn sweep_loop(
    registry: Weak<Inner>,
    mut shutdown: watch::Receiver<bool>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = registry.upgrade() else { break };
                SessionRegistry { inner }.expire_idle(Utc::now()).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Session sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{ConnectionId, PushRelay};
    use crate::sessions::protocol::ServerMessage;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(PushRelay::new()), RegistrySettings::default())
    }

    fn connect(registry: &SessionRegistry, user: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .relay()
            .connections()
            .register(user, ConnectionId::new(), tx);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn observed_states(messages: Vec<ServerMessage>) -> Vec<Value> {
        messages
            .into_iter()
            .filter_map(|msg| match msg {
                ServerMessage::StateUpdate { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_session_with_host_as_sole_participant() -> anyhow::Result<()> {
        let registry = registry();
        let state = json!({"phase": "waiting"});
        let session = registry.create_session("teacher", state.clone(), None).await?;

        assert_eq!(session.participants.len(), 1);
        assert!(session.has_participant("teacher"));
        assert_eq!(session.state, state);
        assert_eq!(session.session_id.len(), 6);
        assert_eq!(registry.get_session(&session.session_id).await?, session);
        Ok(())
    }

    #[tokio::test]
    async fn test_create_session_with_supplied_code() -> anyhow::Result<()> {
        let registry = registry();
        let session = registry
            .create_session("teacher", json!({}), Some(" abc123 "))
            .await?;
        assert_eq!(session.session_id, "ABC123");

        let duplicate = registry
            .create_session("other", json!({}), Some("ABC123"))
            .await;
        assert_eq!(duplicate, Err(SessionError::Duplicate("ABC123".into())));

        let malformed = registry.create_session("other", json!({}), Some("no!")).await;
        assert!(matches!(malformed, Err(SessionError::Malformed(_))));
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_join_is_idempotent() -> anyhow::Result<()> {
        let registry = registry();
        let mut host_rx = connect(&registry, "teacher");
        registry.create_session("teacher", json!({}), Some("ABC123")).await?;
        assert!(matches!(
            drain(&mut host_rx).as_slice(),
            [ServerMessage::SessionCreated { .. }]
        ));

        let first = registry.join_session("abc123", "amy").await?;
        assert!(first.newly_joined);
        let second = registry.join_session("ABC123", "amy").await?;
        assert!(!second.newly_joined);
        assert_eq!(first.session.participants, second.session.participants);

        assert_eq!(
            drain(&mut host_rx),
            vec![ServerMessage::ParticipantJoined {
                session_id: "ABC123".into(),
                user_id: "amy".into()
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_join_unknown_session_has_no_side_effects() -> anyhow::Result<()> {
        let registry = registry();
        let live = registry.create_session("teacher", json!({}), Some("ABC123")).await?;

        let result = registry.join_session("ZZZZZZ", "amy").await;
        assert_eq!(result, Err(SessionError::NotFound("ZZZZZZ".into())));
        assert_eq!(registry.get_session("ABC123").await?, live);
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_state_replaces_wholesale() -> anyhow::Result<()> {
        let registry = registry();
        registry
            .create_session("teacher", json!({"phase": "waiting", "scores": {"amy": 1}}), Some("ABC123"))
            .await?;

        assert!(registry.update_state("ABC123", json!({"phase": "playing"})).await);
        let session = registry.get_session("ABC123").await?;
        assert_eq!(session.state, json!({"phase": "playing"}));
        assert!(session.updated_at >= session.created_at);

        // Missing sessions are ignored, not raised.
        assert!(!registry.update_state("ZZZZZZ", json!({})).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_state_as_requires_membership() -> anyhow::Result<()> {
        let registry = registry();
        registry.create_session("teacher", json!({}), Some("ABC123")).await?;

        let outsider = registry.update_state_as("ABC123", "mallory", json!({"hacked": true})).await;
        assert!(matches!(outsider, Err(SessionError::NotParticipant { .. })));
        assert_eq!(registry.get_session("ABC123").await?.state, json!({}));

        registry.join_session("ABC123", "amy").await?;
        assert_eq!(
            registry.update_state_as("ABC123", "amy", json!({"word": "CAT"})).await,
            Ok(true)
        );
        assert_eq!(
            registry.update_state_as("ZZZZZZ", "amy", json!({})).await,
            Ok(false)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_host_leave_tears_down_and_notifies() -> anyhow::Result<()> {
        let registry = registry();
        let mut amy_rx = connect(&registry, "amy");
        let mut bo_rx = connect(&registry, "bo");
        registry.create_session("teacher", json!({}), Some("ABC123")).await?;
        registry.join_session("ABC123", "amy").await?;
        registry.join_session("ABC123", "bo").await?;
        drain(&mut amy_rx);
        drain(&mut bo_rx);

        assert_eq!(
            registry.leave_session("ABC123", "teacher").await,
            Ok(LeaveOutcome::Ended)
        );
        assert_eq!(
            registry.get_session("ABC123").await,
            Err(SessionError::NotFound("ABC123".into()))
        );
        for rx in [&mut amy_rx, &mut bo_rx] {
            assert!(matches!(
                drain(rx).as_slice(),
                [ServerMessage::SessionEnded { session_id, .. }] if session_id == "ABC123"
            ));
        }
        assert!(registry.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_participant_leave_keeps_session() -> anyhow::Result<()> {
        let registry = registry();
        let mut host_rx = connect(&registry, "teacher");
        registry.create_session("teacher", json!({}), Some("ABC123")).await?;
        registry.join_session("ABC123", "amy").await?;
        drain(&mut host_rx);

        assert_eq!(registry.leave_session("ABC123", "amy").await, Ok(LeaveOutcome::Left));
        assert_eq!(
            registry.leave_session("ABC123", "amy").await,
            Ok(LeaveOutcome::NotMember)
        );
        let session = registry.get_session("ABC123").await?;
        assert_eq!(session.participants.len(), 1);
        assert_eq!(
            drain(&mut host_rx),
            vec![ServerMessage::ParticipantLeft {
                session_id: "ABC123".into(),
                user_id: "amy".into()
            }]
        );

        assert_eq!(
            registry.leave_session("ZZZZZZ", "amy").await,
            Err(SessionError::NotFound("ZZZZZZ".into()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_expire_idle_evicts_stale_sessions() -> anyhow::Result<()> {
        let registry = SessionRegistry::new(
            Arc::new(PushRelay::new()),
            RegistrySettings {
                session_ttl: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(60),
            },
        );
        let mut amy_rx = connect(&registry, "amy");
        registry.create_session("teacher", json!({}), Some("OLD111")).await?;
        registry.join_session("OLD111", "amy").await?;
        registry.create_session("teacher2", json!({}), Some("NEW222")).await?;
        drain(&mut amy_rx);

        // Nothing is stale yet.
        assert!(registry.expire_idle(Utc::now()).await.is_empty());

        let later = Utc::now() + TimeDelta::seconds(120);
        let mut expired = registry.expire_idle(later).await;
        expired.sort();
        assert_eq!(expired, vec!["NEW222".to_string(), "OLD111".to_string()]);
        assert!(registry.is_empty());
        assert!(matches!(
            drain(&mut amy_rx).as_slice(),
            [ServerMessage::SessionEnded { message, .. }] if message == EndReason::Expired.message()
        ));
        Ok(())
    }

    /// Settings whose TTL elapses in wall-clock time almost immediately, while the sweep
    /// interval is driven by the paused tokio clock.
    fn sweep_settings() -> RegistrySettings {
        RegistrySettings {
            session_ttl: Duration::from_millis(1),
            sweep_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_sessions_on_interval() -> anyhow::Result<()> {
        let registry = SessionRegistry::init(Arc::new(PushRelay::new()), sweep_settings());
        let mut amy_rx = connect(&registry, "amy");
        registry.create_session("teacher", json!({}), Some("IDLE01")).await?;
        registry.join_session("IDLE01", "amy").await?;
        drain(&mut amy_rx);
        std::thread::sleep(Duration::from_millis(5));

        // Before the first interval nothing is swept.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(registry.is_empty());
        assert!(matches!(
            drain(&mut amy_rx).as_slice(),
            [ServerMessage::SessionEnded { message, .. }] if message == EndReason::Expired.message()
        ));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_stops_after_shutdown() -> anyhow::Result<()> {
        let registry = SessionRegistry::init(Arc::new(PushRelay::new()), sweep_settings());
        assert_eq!(registry.shutdown().await, 0);

        registry.create_session("teacher", json!({}), Some("LATE01")).await?;
        std::thread::sleep(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert!(registry.get_session("LATE01").await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_and_shutdown() -> anyhow::Result<()> {
        let registry = registry();
        let mut amy_rx = connect(&registry, "amy");
        let mut recovered = Session::new("REST01".into(), "teacher".into(), json!({"phase": "playing"}));
        recovered.participants.insert("amy".into());

        assert_eq!(registry.restore(vec![recovered.clone(), recovered.clone()]), 1);
        assert_eq!(registry.get_session("REST01").await?, recovered);
        // Restoring publishes nothing.
        assert!(drain(&mut amy_rx).is_empty());

        assert_eq!(registry.shutdown().await, 1);
        assert!(registry.is_empty());
        assert!(matches!(
            drain(&mut amy_rx).as_slice(),
            [ServerMessage::SessionEnded { message, .. }] if message == EndReason::Shutdown.message()
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_sequential_updates_are_observed_in_apply_order() -> anyhow::Result<()> {
        let registry = registry();
        let mut host_rx = connect(&registry, "teacher");
        let mut amy_rx = connect(&registry, "amy");
        registry.create_session("teacher", json!({"n": 0}), Some("ABC123")).await?;
        registry.join_session("ABC123", "amy").await?;
        drain(&mut host_rx);
        drain(&mut amy_rx);

        for n in 1..=20 {
            registry.update_state("ABC123", json!({"n": n})).await;
        }

        let expected: Vec<Value> = (1..=20).map(|n| json!({"n": n})).collect();
        assert_eq!(observed_states(drain(&mut host_rx)), expected);
        assert_eq!(observed_states(drain(&mut amy_rx)), expected);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_observed_in_one_order() -> anyhow::Result<()> {
        let registry = registry();
        let mut host_rx = connect(&registry, "teacher");
        let mut amy_rx = connect(&registry, "amy");
        registry.create_session("teacher", json!({"n": 0}), Some("ABC123")).await?;
        registry.join_session("ABC123", "amy").await?;
        drain(&mut host_rx);
        drain(&mut amy_rx);

        let mut handles = Vec::new();
        for n in 1..=50 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.update_state("ABC123", json!({"n": n})).await
            }));
        }
        for handle in handles {
            assert!(handle.await?);
        }

        let host_seen = observed_states(drain(&mut host_rx));
        let amy_seen = observed_states(drain(&mut amy_rx));
        assert_eq!(amy_seen.len(), 50);
        // Every participant observes the same sequence, and it ends on the applied state.
        assert_eq!(host_seen, amy_seen);
        let final_state = registry.get_session("ABC123").await?.state;
        assert_eq!(amy_seen.last(), Some(&final_state));
        Ok(())
    }
}
