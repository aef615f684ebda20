//! Session lifecycle manager.
//!
//! Owns the provider session for this execution context: restores it on
//! startup, refreshes it ahead of expiry, tracks user inactivity, and keeps
//! sibling contexts in agreement over the broadcast bus. All backend traffic
//! goes through [`crate::identity::IdentityProvider`].
//!
//! Construction must happen inside a tokio runtime; the manager spawns its
//! sync listener immediately.

mod activity;
mod bus;
mod events;
mod fingerprint;
mod history;

pub use activity::{ActivitySource, ManualActivity};
pub use bus::{BroadcastBus, InProcessBus};
pub use events::{ListenerId, SessionEvent, SessionEventKind};
pub use fingerprint::{FingerprintProvider, FixedFingerprint, HostFingerprint};

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use uuid::Uuid;

use tether_shared::{ProviderSession, SwitchRecord, SyncEnvelope, SyncKind};

use crate::config::SessionConfig;
use crate::identity::IdentityProvider;
use events::EventRegistry;
use history::SwitchHistory;

/// Where the managed session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No session held: nothing restored yet, or signed out. A new
    /// [`SessionManager::initialize`] may restore from here.
    Uninitialized,
    /// A session is held and scheduled for refresh.
    Active,
    /// A refresh request is in flight.
    Refreshing,
    /// The session died because a refresh failed; the caller must
    /// re-authenticate.
    Expired,
}

struct SessionState {
    session: Option<ProviderSession>,
    phase: SessionPhase,
    adopted_at: chrono::DateTime<Utc>,
    last_seq: u64,
    last_activity: Instant,
    refresh_task: Option<JoinHandle<()>>,
    inactivity_task: Option<JoinHandle<()>>,
}

struct SessionInner {
    provider: Arc<dyn IdentityProvider>,
    bus: Arc<dyn BroadcastBus>,
    config: SessionConfig,
    fingerprint: String,
    origin: String,
    state: Mutex<SessionState>,
    events: EventRegistry,
    history: Mutex<SwitchHistory>,
}

/// Builder for [`SessionManager`]. Capabilities not supplied fall back to
/// in-process defaults.
pub struct SessionManagerBuilder {
    provider: Arc<dyn IdentityProvider>,
    config: SessionConfig,
    bus: Option<Arc<dyn BroadcastBus>>,
    fingerprint: Option<Arc<dyn FingerprintProvider>>,
}

impl SessionManagerBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bus(mut self, bus: Arc<dyn BroadcastBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn fingerprint(mut self, provider: Arc<dyn FingerprintProvider>) -> Self {
        self.fingerprint = Some(provider);
        self
    }

    pub fn build(self) -> SessionManager {
        let bus = self.bus.unwrap_or_else(|| Arc::new(InProcessBus::new()));
        let fingerprint = self
            .fingerprint
            .unwrap_or_else(|| Arc::new(HostFingerprint))
            .fingerprint();
        let inner = Arc::new(SessionInner {
            provider: self.provider,
            bus,
            config: self.config,
            fingerprint,
            origin: Uuid::new_v4().to_string(),
            state: Mutex::new(SessionState {
                session: None,
                phase: SessionPhase::Uninitialized,
                adopted_at: Utc::now(),
                last_seq: 0,
                last_activity: Instant::now(),
                refresh_task: None,
                inactivity_task: None,
            }),
            events: EventRegistry::default(),
            history: Mutex::new(SwitchHistory::default()),
        });
        spawn_sync_listener(&inner);
        SessionManager { inner }
    }
}

/// Handle to the session lifecycle machinery. Cheap to clone; clones share
/// one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn builder(provider: Arc<dyn IdentityProvider>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            provider,
            config: SessionConfig::default(),
            bus: None,
            fingerprint: None,
        }
    }

    /// Attempt to restore a persisted session from the provider. Failure to
    /// restore is not fatal; the context simply starts signed out. While a
    /// session is already held this is a no-op returning that session;
    /// after a logout or expiry a fresh restore is attempted.
    pub async fn initialize(&self) -> Option<ProviderSession> {
        {
            let state = self.inner.state.lock().expect("session state poisoned");
            if matches!(state.phase, SessionPhase::Active | SessionPhase::Refreshing) {
                return state.session.clone();
            }
        }
        match self.inner.provider.current_session().await {
            Ok(Some(session)) => {
                crate::log_info!("restored session for user {:?}", session.user_id);
                self.inner.adopt(session.clone(), true);
                Some(session)
            }
            Ok(None) => {
                crate::log_debug!("no persisted session to restore");
                None
            }
            Err(e) => {
                crate::log_warn!("session restore failed: {}", e);
                None
            }
        }
    }

    /// End the session everywhere: server side (best effort), locally, and
    /// in every sibling context.
    pub async fn sign_out(&self) {
        if let Err(e) = self.inner.provider.sign_out().await {
            crate::log_warn!("server side sign out failed: {}", e);
        }
        self.inner.clear(SessionPhase::Uninitialized);
        self.inner.broadcast(SyncKind::SessionLogout, None);
        self.inner.events.emit(&SessionEvent::Logout);
        crate::log_info!("signed out");
    }

    pub fn current_session(&self) -> Option<ProviderSession> {
        self.inner
            .state
            .lock()
            .expect("session state poisoned")
            .session
            .clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().expect("session state poisoned").phase
    }

    /// Whether a session is held, not past its expiry, and not idle beyond
    /// the inactivity window. Expiry and inactivity each invalidate on their
    /// own. Sessions without a provider expiry are trusted for the
    /// configured fallback TTL from adoption.
    pub fn is_session_valid(&self) -> bool {
        let state = self.inner.state.lock().expect("session state poisoned");
        let Some(session) = &state.session else {
            return false;
        };
        if state.last_activity.elapsed() >= self.inner.config.max_inactivity {
            return false;
        }
        match session.expires_at {
            Some(expires_at) => expires_at > Utc::now(),
            None => {
                let ttl = chrono::Duration::from_std(self.inner.config.fallback_ttl)
                    .unwrap_or(chrono::Duration::MAX);
                Utc::now() - state.adopted_at < ttl
            }
        }
    }

    /// Report one unit of user activity, pushing the inactivity deadline
    /// out. A no-op while signed out.
    pub fn record_activity(&self) {
        let mut state = self.inner.state.lock().expect("session state poisoned");
        if state.session.is_some() {
            state.last_activity = Instant::now();
        }
    }

    /// Forward every tick from `source` into [`Self::record_activity`].
    pub fn attach_activity(&self, source: &dyn ActivitySource) {
        let mut rx = source.watch();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let Some(inner) = weak.upgrade() else { break };
                let mut state = inner.state.lock().expect("session state poisoned");
                if state.session.is_some() {
                    state.last_activity = Instant::now();
                }
            }
        });
    }

    pub fn on(
        &self,
        kind: SessionEventKind,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.events.on(kind, callback)
    }

    pub fn off(&self, listener: ListenerId) -> bool {
        self.inner.events.off(listener)
    }

    pub fn record_switch(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        duration_ms: Option<u64>,
    ) {
        self.inner
            .history
            .lock()
            .expect("switch history poisoned")
            .record(from, to, duration_ms);
    }

    pub fn recent_switches(&self) -> Vec<SwitchRecord> {
        self.inner
            .history
            .lock()
            .expect("switch history poisoned")
            .recent()
    }

    pub fn fingerprint(&self) -> &str {
        &self.inner.fingerprint
    }
}

impl SessionInner {
    /// Install a session: store it, arm the refresh and inactivity timers,
    /// and optionally announce it to sibling contexts.
    fn adopt(self: &Arc<Self>, session: ProviderSession, announce: bool) {
        {
            let mut state = self.state.lock().expect("session state poisoned");
            state.session = Some(session.clone());
            state.phase = SessionPhase::Active;
            state.adopted_at = Utc::now();
            state.last_activity = Instant::now();
        }
        self.schedule_refresh(&session);
        self.ensure_inactivity_timer();
        if announce {
            self.broadcast(SyncKind::SessionUpdate, Some(session));
        }
    }

    fn clear(&self, phase: SessionPhase) {
        let mut state = self.state.lock().expect("session state poisoned");
        state.session = None;
        state.phase = phase;
        if let Some(task) = state.refresh_task.take() {
            task.abort();
        }
        if let Some(task) = state.inactivity_task.take() {
            task.abort();
        }
    }

    fn refresh_delay(&self, session: &ProviderSession) -> Duration {
        let lifetime = match session.expires_at {
            Some(expires_at) => (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => self.config.fallback_ttl,
        };
        lifetime.saturating_sub(self.config.auto_refresh_buffer)
    }

    fn schedule_refresh(self: &Arc<Self>, session: &ProviderSession) {
        let delay = self.refresh_delay(session);
        crate::log_debug!("next session refresh in {:?}", delay);
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.run_refresh().await;
            }
        });
        let mut state = self.state.lock().expect("session state poisoned");
        if let Some(old) = state.refresh_task.replace(handle) {
            old.abort();
        }
    }

    async fn run_refresh(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if state.session.is_none() {
                return;
            }
            state.phase = SessionPhase::Refreshing;
        }
        match self.provider.refresh_session().await {
            Ok(session) => {
                crate::log_info!("session refreshed");
                self.adopt(session.clone(), true);
                self.events.emit(&SessionEvent::Refreshed(session));
            }
            Err(e) => {
                // A session that cannot be refreshed is dead. Holding on to
                // it would leave the user half signed in, so end it here and
                // tell every sibling context.
                crate::log_error!("session refresh failed: {}", e);
                self.clear(SessionPhase::Expired);
                self.broadcast(SyncKind::SessionLogout, None);
                self.events.emit(&SessionEvent::Logout);
            }
        }
    }

    /// One long-lived watcher per manager. Emits `Inactive` once per
    /// inactivity episode; new activity starts a fresh episode. The session
    /// itself is left in place.
    fn ensure_inactivity_timer(self: &Arc<Self>) {
        {
            let state = self.state.lock().expect("session state poisoned");
            if state.inactivity_task.is_some() {
                return;
            }
        }
        let window = self.config.max_inactivity;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut emitted_for: Option<Instant> = None;
            loop {
                let last_activity = {
                    let Some(inner) = weak.upgrade() else { break };
                    let state = inner.state.lock().expect("session state poisoned");
                    if state.session.is_none() {
                        break;
                    }
                    state.last_activity
                };
                let deadline = last_activity + window;
                if Instant::now() >= deadline {
                    if emitted_for != Some(last_activity) {
                        emitted_for = Some(last_activity);
                        let Some(inner) = weak.upgrade() else { break };
                        crate::log_warn!("no activity for {:?}", window);
                        inner.events.emit(&SessionEvent::Inactive);
                    }
                    // Idle; poll for the next activity episode.
                    sleep(window).await;
                } else {
                    sleep_until(deadline).await;
                }
            }
        });
        let mut state = self.state.lock().expect("session state poisoned");
        if let Some(old) = state.inactivity_task.replace(handle) {
            old.abort();
        }
    }

    fn next_seq(&self) -> u64 {
        let mut state = self.state.lock().expect("session state poisoned");
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let seq = now_ms.max(state.last_seq + 1);
        state.last_seq = seq;
        seq
    }

    fn broadcast(&self, kind: SyncKind, data: Option<ProviderSession>) {
        let envelope = SyncEnvelope {
            kind,
            data,
            seq: self.next_seq(),
            origin: self.origin.clone(),
        };
        self.bus.publish(envelope);
    }

    fn handle_envelope(self: &Arc<Self>, envelope: SyncEnvelope) {
        if envelope.origin == self.origin {
            return;
        }
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if envelope.seq < state.last_seq {
                crate::log_debug!(
                    "dropping stale sync envelope (seq {} < {})",
                    envelope.seq,
                    state.last_seq
                );
                return;
            }
            state.last_seq = envelope.seq;
        }
        match envelope.kind {
            SyncKind::SessionUpdate => {
                if let Some(session) = envelope.data {
                    crate::log_debug!("adopting session from sibling context");
                    self.adopt(session.clone(), false);
                    self.events.emit(&SessionEvent::Synced(session));
                }
            }
            SyncKind::SessionLogout => {
                crate::log_info!("sibling context signed out");
                self.clear(SessionPhase::Uninitialized);
                self.events.emit(&SessionEvent::Logout);
            }
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let Some(task) = state.refresh_task.take() {
                task.abort();
            }
            if let Some(task) = state.inactivity_task.take() {
                task.abort();
            }
        }
    }
}

fn spawn_sync_listener(inner: &Arc<SessionInner>) {
    let mut rx = inner.bus.subscribe();
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.handle_envelope(envelope);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    crate::log_warn!("sync listener lagged, dropped {} envelopes", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
