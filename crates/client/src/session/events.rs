//! Typed publish/subscribe registry for session lifecycle events.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tether_shared::ProviderSession;

/// Session lifecycle event delivered to registered listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A scheduled refresh succeeded and the session was replaced.
    Refreshed(ProviderSession),
    /// The session ended: explicit logout, refresh failure, or a logout
    /// broadcast from another context.
    Logout,
    /// A session broadcast from another context was adopted.
    Synced(ProviderSession),
    /// No activity was recorded for the configured window. The session is
    /// kept; the caller decides whether inactivity forces a logout.
    Inactive,
}

impl SessionEvent {
    pub fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::Refreshed(_) => SessionEventKind::Refreshed,
            SessionEvent::Logout => SessionEventKind::Logout,
            SessionEvent::Synced(_) => SessionEventKind::Synced,
            SessionEvent::Inactive => SessionEventKind::Inactive,
        }
    }
}

/// Event name used when registering listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Refreshed,
    Logout,
    Synced,
    Inactive,
}

/// Handle identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Entry {
    id: u64,
    kind: SessionEventKind,
    callback: Arc<dyn Fn(&SessionEvent) + Send + Sync>,
}

/// Ordered listener registry with per-listener panic isolation.
#[derive(Default)]
pub(crate) struct EventRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub fn on(
        &self,
        kind: SessionEventKind,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .expect("event registry poisoned")
            .push(Entry {
                id,
                kind,
                callback: Arc::new(callback),
            });
        ListenerId(id)
    }

    pub fn off(&self, listener: ListenerId) -> bool {
        let mut entries = self.entries.lock().expect("event registry poisoned");
        let before = entries.len();
        entries.retain(|entry| entry.id != listener.0);
        entries.len() != before
    }

    /// Deliver an event to its listeners in registration order. A panicking
    /// listener is logged and does not stop delivery to the rest.
    pub fn emit(&self, event: &SessionEvent) {
        let kind = event.kind();
        let targets: Vec<Arc<dyn Fn(&SessionEvent) + Send + Sync>> = self
            .entries
            .lock()
            .expect("event registry poisoned")
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.callback.clone())
            .collect();
        for callback in targets {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                crate::log_error!("session listener panicked handling {:?}", kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_fire_in_registration_order() {
        let registry = EventRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let log = log.clone();
            let _ = registry.on(SessionEventKind::Inactive, move |_| {
                log.lock().unwrap().push(label);
            });
        }
        registry.emit(&SessionEvent::Inactive);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn listeners_only_receive_their_kind() {
        let registry = EventRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let _ = registry.on(SessionEventKind::Logout, move |_| {
            log_clone.lock().unwrap().push("logout");
        });

        registry.emit(&SessionEvent::Inactive);
        assert!(log.lock().unwrap().is_empty());
        registry.emit(&SessionEvent::Logout);
        assert_eq!(*log.lock().unwrap(), vec!["logout"]);
    }

    #[test]
    fn removed_listener_stops_firing() {
        let registry = EventRegistry::default();
        let log = Arc::new(Mutex::new(0usize));
        let log_clone = log.clone();
        let id = registry.on(SessionEventKind::Inactive, move |_| {
            *log_clone.lock().unwrap() += 1;
        });

        registry.emit(&SessionEvent::Inactive);
        assert!(registry.off(id));
        registry.emit(&SessionEvent::Inactive);
        assert_eq!(*log.lock().unwrap(), 1);
        assert!(!registry.off(id));
    }

    #[test]
    fn panicking_listener_does_not_break_the_rest() {
        let registry = EventRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _ = registry.on(SessionEventKind::Inactive, |_| panic!("bad listener"));
        let log_clone = log.clone();
        let _ = registry.on(SessionEventKind::Inactive, move |_| {
            log_clone.lock().unwrap().push("survivor");
        });

        registry.emit(&SessionEvent::Inactive);
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }
}
