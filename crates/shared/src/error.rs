//! Error taxonomy for the tether client.
//!
//! Expected failure modes (disconnects, expiries, dropped frames) surface
//! through connection status and emitted events rather than errors; the types
//! here cover the cases a caller must handle explicitly.

use thiserror::Error;

/// Failures at the transport (socket) layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The WebSocket handshake did not complete.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    /// Operation attempted on a connection that was explicitly closed.
    #[error("connection was closed")]
    Closed,
}

/// Failures surfaced by the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid endpoint url `{0}`")]
    InvalidUrl(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Programming errors rejected synchronously by the change feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Predicates must be a single `field=value` equality.
    #[error("invalid filter predicate `{0}`, expected `field=value`")]
    InvalidPredicate(String),
    #[error("duplicate subscription id `{0}`")]
    DuplicateId(String),
}

/// Failures talking to the identity provider.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("identity service unreachable: {0}")]
    Network(String),
    #[error("identity service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("failed to decode identity response: {0}")]
    Decode(String),
    /// Sign-out or refresh was attempted with no tokens on hand.
    #[error("no session material available")]
    NoTokens,
}
