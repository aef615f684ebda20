//! Wire protocol definitions: transport control frames, change-feed
//! registrations, and the cross-context session broadcast envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{EventFilter, ProviderSession};

/// Channel name used for cross-context session broadcasts.
pub const SESSION_SYNC_CHANNEL: &str = "tether_session_sync";

/// Control frames exchanged on a transport connection.
///
/// Anything that does not decode as a control frame is treated as an opaque
/// application payload and handed to subscribers untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Announce interest in a logical channel.
    Subscribe { channel: String, id: String },
    /// Withdraw interest in a logical channel.
    Unsubscribe { channel: String, id: String },
    /// Heartbeat probe sent by the client while connected.
    Ping,
    /// Heartbeat reply; consumed by the transport, never dispatched.
    Pong,
    /// Server-side change-feed registration for one subscription.
    Register {
        channel: String,
        id: String,
        table: String,
        event: EventFilter,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
}

impl ControlFrame {
    /// Serialize to the JSON text put on the wire.
    pub fn to_wire(&self) -> String {
        // Control frames are plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Try to decode an inbound value as a control frame.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Kind of a cross-context session broadcast.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncKind {
    #[serde(rename = "SESSION_UPDATE")]
    SessionUpdate,
    #[serde(rename = "SESSION_LOGOUT")]
    SessionLogout,
}

/// Envelope replicated over the broadcast bus between same-origin contexts.
///
/// `seq` is a millisecond timestamp used to reject stale envelopes: two
/// contexts refreshing concurrently otherwise race, and the loser could
/// resurrect an already-replaced session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    #[serde(rename = "type")]
    pub kind: SyncKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ProviderSession>,
    pub seq: u64,
    /// Opaque id of the emitting context, used to skip loopback delivery.
    pub origin: String,
}
