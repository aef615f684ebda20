//! WebSocket transport layer.
//!
//! This module provides:
//! - Connection management with heartbeats and auto-reconnect
//! - A pool keying at most one live connection per endpoint URL
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  ConnectionPool                     │
//! │        (one live WsConnection per endpoint)         │
//! └─────────────────────────────────────────────────────┘
//!                         │
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!   ┌────────────┐ ┌────────────┐ ┌────────────┐
//!   │WsConnection│ │WsConnection│ │WsConnection│
//!   │ (endpoint A)│ │(endpoint B)│ │(endpoint C)│
//!   └────────────┘ └────────────┘ └────────────┘
//!          │              │              │
//!          ▼              ▼              ▼
//!    payload subscribers (e.g. the change feed)
//! ```
//!
//! Callers observe connection health through [`ConnectionStatus`] and
//! status listeners rather than errors; an unexpected close is retried with
//! exponential backoff, an explicit [`WsConnection::disconnect`] is terminal.

mod connection;
mod pool;

pub use connection::{ConnectionStatus, StatusListener, WsConnection};
pub use pool::{normalize_endpoint, ConnectionPool};
