//! Shared types for the tether resilience layer: wire frames, change-feed
//! models, session records, and error taxonomy.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
