//! Cross-context broadcast bus.
//!
//! Session updates and logouts are replicated between same-origin execution
//! contexts over this bus. The in-process implementation covers tests and
//! single-process hosts; a multi-process host supplies an OS-level
//! equivalent (e.g. a unix socket fan-out) behind the same trait, keyed by
//! [`tether_shared::SESSION_SYNC_CHANNEL`].

use tokio::sync::broadcast;

use tether_shared::SyncEnvelope;

/// Same-origin publish/subscribe channel carrying session sync envelopes.
pub trait BroadcastBus: Send + Sync {
    /// Publish an envelope to every subscribed context, including the
    /// sender's own receivers (loopback is filtered by envelope origin).
    fn publish(&self, envelope: SyncEnvelope);

    /// Open a receiver for envelopes published on this channel.
    fn subscribe(&self) -> broadcast::Receiver<SyncEnvelope>;
}

/// In-process bus backed by a tokio broadcast channel.
pub struct InProcessBus {
    tx: broadcast::Sender<SyncEnvelope>,
}

impl InProcessBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self { tx }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastBus for InProcessBus {
    fn publish(&self, envelope: SyncEnvelope) {
        // No receivers is fine; a lone context still publishes.
        let _ = self.tx.send(envelope);
    }

    fn subscribe(&self) -> broadcast::Receiver<SyncEnvelope> {
        self.tx.subscribe()
    }
}
