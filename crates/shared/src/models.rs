//! Data models shared across the tether transport, change feed, and session
//! layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- Change feed ---

/// Row-level change kind pushed by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Event filter attached to a subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventFilter {
    /// Matches every change kind.
    Any,
    Insert,
    Update,
    Delete,
}

impl EventFilter {
    /// Whether a change of the given kind passes this filter.
    pub fn matches(self, kind: ChangeKind) -> bool {
        match self {
            EventFilter::Any => true,
            EventFilter::Insert => kind == ChangeKind::Insert,
            EventFilter::Update => kind == ChangeKind::Update,
            EventFilter::Delete => kind == ChangeKind::Delete,
        }
    }
}

/// One row-level change pushed over the change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: String,
    pub event: ChangeKind,
    #[serde(default)]
    pub new_row: Value,
    #[serde(default)]
    pub old_row: Value,
}

// --- Session ---

/// Session material handed out by the identity provider.
///
/// Replaced wholesale on every refresh; never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSession {
    pub access_token: String,
    pub refresh_token: String,
    /// Provider-reported absolute expiry. Absent when the provider does not
    /// report one; callers fall back to a fixed horizon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

// --- Activity history ---

/// One entry of the bounded location-switch history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRecord {
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}
