//! Change-feed multiplexer.
//!
//! Presents many independent (table, event, filter) subscriptions as if each
//! had its own connection while physically sharing one transport connection
//! per application. Inbound change events are routed to every matching
//! subscriber; after a reconnect every active subscription is re-registered
//! server-side exactly once. Events that occurred while disconnected are not
//! backfilled.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use uuid::Uuid;

use tether_shared::{ChangeEvent, ControlFrame, EventFilter, FeedError};

use crate::ws::{ConnectionStatus, StatusListener, WsConnection};

/// Parsed `field=value` equality predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Predicate {
    field: String,
    value: String,
}

impl Predicate {
    fn parse(raw: &str) -> Result<Self, FeedError> {
        match raw.split_once('=') {
            Some((field, value)) if !field.is_empty() => Ok(Self {
                field: field.to_string(),
                value: value.to_string(),
            }),
            _ => Err(FeedError::InvalidPredicate(raw.to_string())),
        }
    }

    /// Exact field-equality match against the new row of a change.
    fn matches(&self, row: &Value) -> bool {
        match row.get(&self.field) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

struct FeedSubscription {
    id: String,
    table: String,
    event: EventFilter,
    filter: Option<String>,
    predicate: Option<Predicate>,
    callback: Arc<dyn Fn(&ChangeEvent) + Send + Sync>,
}

impl FeedSubscription {
    fn matches(&self, change: &ChangeEvent) -> bool {
        if self.table != change.table {
            return false;
        }
        if !self.event.matches(change.event) {
            return false;
        }
        match &self.predicate {
            Some(predicate) => predicate.matches(&change.new_row),
            None => true,
        }
    }
}

/// Registration-ordered set of subscriptions. Split out from the feed so the
/// matching and dispatch rules are testable without a socket.
#[derive(Default)]
struct SubscriptionSet {
    entries: Vec<FeedSubscription>,
}

impl SubscriptionSet {
    fn insert(&mut self, sub: FeedSubscription) -> Result<(), FeedError> {
        if self.entries.iter().any(|existing| existing.id == sub.id) {
            return Err(FeedError::DuplicateId(sub.id));
        }
        self.entries.push(sub);
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|sub| sub.id != id);
        self.entries.len() != before
    }

    /// Callbacks matching a change, in registration order. Matching is
    /// evaluated independently per subscription.
    fn targets(&self, change: &ChangeEvent) -> Vec<(String, Arc<dyn Fn(&ChangeEvent) + Send + Sync>)> {
        self.entries
            .iter()
            .filter(|sub| sub.matches(change))
            .map(|sub| (sub.id.clone(), sub.callback.clone()))
            .collect()
    }

    fn snapshot(&self) -> Vec<ActiveSubscription> {
        self.entries
            .iter()
            .map(|sub| ActiveSubscription {
                id: sub.id.clone(),
                table: sub.table.clone(),
                event: sub.event,
                filter: sub.filter.clone(),
            })
            .collect()
    }
}

/// Parameters for [`ChangeFeed::subscribe`].
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    /// Subscription id; generated when absent.
    pub id: Option<String>,
    pub table: String,
    pub event: EventFilter,
    /// Optional `field=value` equality predicate on the new row.
    pub filter: Option<String>,
}

impl SubscribeRequest {
    pub fn new(table: impl Into<String>, event: EventFilter) -> Self {
        Self {
            id: None,
            table: table.into(),
            event,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Read-only snapshot of one active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSubscription {
    pub id: String,
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<String>,
}

struct FeedInner {
    conn: WsConnection,
    channel: String,
    subs: Mutex<SubscriptionSet>,
}

impl FeedInner {
    fn register_frame(&self, sub: &ActiveSubscription) -> ControlFrame {
        ControlFrame::Register {
            channel: self.channel.clone(),
            id: sub.id.clone(),
            table: sub.table.clone(),
            event: sub.event,
            filter: sub.filter.clone(),
        }
    }

    /// Re-issue the server-side registration for every active subscription.
    /// Runs once per transition to `Connected`.
    fn replay(&self) {
        let snapshot = self.subs.lock().expect("subscription registry poisoned").snapshot();
        if snapshot.is_empty() {
            return;
        }
        crate::log_info!(
            "re-registering {} subscription(s) on {}",
            snapshot.len(),
            self.channel
        );
        for sub in &snapshot {
            self.conn.send_frame(&self.register_frame(sub));
        }
    }

    fn dispatch(&self, change: &ChangeEvent) {
        let targets = self
            .subs
            .lock()
            .expect("subscription registry poisoned")
            .targets(change);
        for (id, callback) in targets {
            if catch_unwind(AssertUnwindSafe(|| callback(change))).is_err() {
                crate::log_error!("subscriber {} panicked handling a change event", id);
            }
        }
    }
}

/// One logical change-feed channel over a shared transport connection.
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
    _status_listener: StatusListener,
}

impl ChangeFeed {
    /// Attach a change feed to a connection under a logical channel name.
    /// Change events arriving on the connection are routed to matching
    /// subscriptions; registrations are replayed on every reconnect.
    pub fn new(conn: WsConnection, channel: impl Into<String>) -> Self {
        let inner = Arc::new(FeedInner {
            conn: conn.clone(),
            channel: channel.into(),
            subs: Mutex::new(SubscriptionSet::default()),
        });

        let dispatch_inner = inner.clone();
        let _ = conn.subscribe(&inner.channel, move |value| {
            match serde_json::from_value::<ChangeEvent>(value) {
                Ok(change) => dispatch_inner.dispatch(&change),
                // Other traffic on the shared channel; not ours to route.
                Err(_) => {}
            }
        });

        let replay_inner = inner.clone();
        let status_listener = conn.on_status_change(move |status| {
            if status == ConnectionStatus::Connected {
                replay_inner.replay();
            }
        });

        Self {
            inner,
            _status_listener: status_listener,
        }
    }

    /// Register a subscription and return its id. If the shared connection
    /// is up, the server-side registration is issued immediately; otherwise
    /// it is queued and issued when the connection (re)connects.
    pub fn subscribe(
        &self,
        request: SubscribeRequest,
        callback: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> Result<String, FeedError> {
        let id = request.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let predicate = request.filter.as_deref().map(Predicate::parse).transpose()?;
        let active = ActiveSubscription {
            id: id.clone(),
            table: request.table.clone(),
            event: request.event,
            filter: request.filter.clone(),
        };

        self.inner
            .subs
            .lock()
            .expect("subscription registry poisoned")
            .insert(FeedSubscription {
                id: id.clone(),
                table: request.table,
                event: request.event,
                filter: request.filter,
                predicate,
                callback: Arc::new(callback),
            })?;

        if self.inner.conn.status().is_connected() {
            self.inner.conn.send_frame(&self.inner.register_frame(&active));
        }
        Ok(id)
    }

    /// Remove the local record. The server-side registration is left in
    /// place (local silence); a host that cares about server fan-out cost
    /// should also send the matching unsubscribe frame.
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.inner
            .subs
            .lock()
            .expect("subscription registry poisoned")
            .remove(id)
    }

    /// Snapshot of every active subscription.
    pub fn active_subscriptions(&self) -> Vec<ActiveSubscription> {
        self.inner
            .subs
            .lock()
            .expect("subscription registry poisoned")
            .snapshot()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .subs
            .lock()
            .expect("subscription registry poisoned")
            .entries
            .len()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.conn.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_shared::ChangeKind;

    fn change(table: &str, kind: ChangeKind, new_row: Value) -> ChangeEvent {
        ChangeEvent {
            table: table.to_string(),
            event: kind,
            new_row,
            old_row: Value::Null,
        }
    }

    fn sub(
        id: &str,
        table: &str,
        event: EventFilter,
        filter: Option<&str>,
        log: Arc<Mutex<Vec<String>>>,
    ) -> FeedSubscription {
        let id_owned = id.to_string();
        FeedSubscription {
            id: id.to_string(),
            table: table.to_string(),
            event,
            filter: filter.map(String::from),
            predicate: filter.map(|raw| Predicate::parse(raw).unwrap()),
            callback: Arc::new(move |_change| {
                log.lock().unwrap().push(id_owned.clone());
            }),
        }
    }

    #[test]
    fn predicate_requires_field_and_value() {
        assert!(Predicate::parse("status=open").is_ok());
        assert!(Predicate::parse("=open").is_err());
        assert!(Predicate::parse("status").is_err());
        // Empty value is a legal equality target.
        assert!(Predicate::parse("status=").is_ok());
    }

    #[test]
    fn predicate_matches_exact_string_equality() {
        let predicate = Predicate::parse("status=open").unwrap();
        assert!(predicate.matches(&json!({"status": "open"})));
        assert!(!predicate.matches(&json!({"status": "closed"})));
        assert!(!predicate.matches(&json!({"other": "open"})));
        assert!(!predicate.matches(&json!({"status": null})));
    }

    #[test]
    fn predicate_matches_non_string_values_textually() {
        let predicate = Predicate::parse("id=7").unwrap();
        assert!(predicate.matches(&json!({"id": 7})));
        assert!(!predicate.matches(&json!({"id": 8})));
    }

    #[test]
    fn insert_and_any_subscribers_fan_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = SubscriptionSet::default();
        set.insert(sub("a", "orders", EventFilter::Insert, None, log.clone()))
            .unwrap();
        set.insert(sub("b", "orders", EventFilter::Any, None, log.clone()))
            .unwrap();

        let insert = change("orders", ChangeKind::Insert, json!({}));
        for (_, callback) in set.targets(&insert) {
            callback(&insert);
        }
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);

        log.lock().unwrap().clear();
        let delete = change("orders", ChangeKind::Delete, json!({}));
        for (_, callback) in set.targets(&delete) {
            callback(&delete);
        }
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
    }

    #[test]
    fn other_tables_never_match() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = SubscriptionSet::default();
        set.insert(sub("a", "orders", EventFilter::Any, None, log.clone()))
            .unwrap();
        let ev = change("users", ChangeKind::Insert, json!({}));
        assert!(set.targets(&ev).is_empty());
    }

    #[test]
    fn filtered_subscription_sees_only_matching_rows() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = SubscriptionSet::default();
        set.insert(sub(
            "a",
            "orders",
            EventFilter::Any,
            Some("status=open"),
            log.clone(),
        ))
        .unwrap();

        let matching = change("orders", ChangeKind::Update, json!({"status": "open"}));
        let other = change("orders", ChangeKind::Update, json!({"status": "closed"}));
        assert_eq!(set.targets(&matching).len(), 1);
        assert!(set.targets(&other).is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = SubscriptionSet::default();
        set.insert(sub("a", "orders", EventFilter::Any, None, log.clone()))
            .unwrap();
        let duplicate = set.insert(sub("a", "orders", EventFilter::Any, None, log));
        assert!(matches!(duplicate, Err(FeedError::DuplicateId(_))));
    }

    #[test]
    fn removal_reports_whether_anything_was_removed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut set = SubscriptionSet::default();
        set.insert(sub("a", "orders", EventFilter::Any, None, log)).unwrap();
        assert!(set.remove("a"));
        assert!(!set.remove("a"));
    }
}
