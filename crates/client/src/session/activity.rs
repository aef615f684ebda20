//! Activity sources feeding the inactivity tracker.
//!
//! A browser host wires pointer/keyboard/scroll/touch listeners into an
//! [`ActivitySource`]; a headless host can report request handling or stdin
//! traffic. Each tick resets the session's inactivity timer.

use std::sync::Mutex;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Emits a unit tick per observed user/host activity.
pub trait ActivitySource: Send + Sync {
    /// Open a stream of activity ticks.
    fn watch(&self) -> UnboundedReceiver<()>;
}

/// Activity source driven by explicit [`ManualActivity::tick`] calls.
pub struct ManualActivity {
    senders: Mutex<Vec<UnboundedSender<()>>>,
}

impl ManualActivity {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Report one unit of activity to every watcher.
    pub fn tick(&self) {
        self.senders
            .lock()
            .expect("activity watcher registry poisoned")
            .retain(|sender| sender.send(()).is_ok());
    }
}

impl Default for ManualActivity {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivitySource for ManualActivity {
    fn watch(&self) -> UnboundedReceiver<()> {
        let (tx, rx) = unbounded_channel();
        self.senders
            .lock()
            .expect("activity watcher registry poisoned")
            .push(tx);
        rx
    }
}
