//! Tether client - connection resilience and session synchronization.
//!
//! This crate keeps a long-lived client process continuously connected to a
//! backend that pushes row-level change events and issues time-limited
//! tokens. It provides:
//! - pooled, auto-reconnecting transport connections with heartbeats
//! - a change-feed multiplexer fanning one connection out to many
//!   (table, event, filter) subscriptions
//! - a session lifecycle manager with silent token refresh, inactivity
//!   tracking, and cross-context broadcast synchronization

pub mod config;
pub mod feed;
pub mod identity;
pub mod logging;
pub mod session;
pub mod ws;

pub use tether_shared as shared;

pub use config::{ConnectionConfig, SessionConfig};
pub use feed::{ActiveSubscription, ChangeFeed, SubscribeRequest};
pub use identity::{HttpIdentityProvider, IdentityProvider};
pub use session::{SessionEvent, SessionEventKind, SessionManager, SessionPhase};
pub use ws::{ConnectionPool, ConnectionStatus, WsConnection};
