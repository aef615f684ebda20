//! Bounded history of location switches, kept for trend inspection. Not
//! correctness-critical.

use std::collections::VecDeque;

use chrono::Utc;
use tether_shared::SwitchRecord;

const MAX_ENTRIES: usize = 50;

/// Append-only ring buffer of the last [`MAX_ENTRIES`] switch records.
#[derive(Default)]
pub(crate) struct SwitchHistory {
    entries: VecDeque<SwitchRecord>,
}

impl SwitchHistory {
    pub fn record(&mut self, from: impl Into<String>, to: impl Into<String>, duration_ms: Option<u64>) {
        if self.entries.len() == MAX_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(SwitchRecord {
            from: from.into(),
            to: to.into(),
            at: Utc::now(),
            duration_ms,
        });
    }

    /// Oldest-first snapshot of the retained records.
    pub fn recent(&self) -> Vec<SwitchRecord> {
        self.entries.iter().cloned().collect()
    }
}
