use std::time::Duration;

use tracing::{debug, trace};

use crate::dom::{Document, MutationRecord};
use crate::scanner::FeedScanner;
use crate::scheduler::{Task, TimerId, Timers};

/// Turns mutation batches into debounced scans.
///
/// One pending timer at most: a new qualifying batch replaces it. While a
/// scan is in flight arriving batches are dropped; the next organic mutation
/// catches up.
#[derive(Debug)]
pub struct MutationWatcher {
    debounce: Duration,
    pending: Option<TimerId>,
    in_flight: bool,
    connected: bool,
}

impl MutationWatcher {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: None,
            in_flight: false,
            connected: false,
        }
    }

    pub fn observe(&mut self) {
        self.connected = true;
        debug!("observer started");
    }

    pub fn pending(&self) -> Option<TimerId> {
        self.pending
    }

    /// Returns true when the batch (re)armed the debounce timer.
    pub fn on_mutations(
        &mut self,
        doc: &Document,
        scanner: &FeedScanner,
        records: &[MutationRecord],
        timers: &mut Timers,
    ) -> bool {
        if !self.connected || self.in_flight {
            return false;
        }
        let qualifies = records
            .iter()
            .flat_map(|record| record.added.iter())
            .any(|node| scanner.is_feed_item(doc, *node));
        if !qualifies {
            return false;
        }
        if let Some(previous) = self.pending.take() {
            timers.cancel(previous);
        }
        let id = timers.schedule(self.debounce, Task::DebouncedScan);
        trace!(?id, "debounce armed");
        self.pending = Some(id);
        true
    }

    /// Called when a `DebouncedScan` timer fires.
    pub fn timer_fired(&mut self, id: TimerId) {
        if self.pending == Some(id) {
            self.pending = None;
        }
    }

    /// Claims the re-entrancy guard. False when a scan is already running.
    pub fn begin_scan(&mut self) -> bool {
        if self.in_flight {
            return false;
        }
        self.in_flight = true;
        true
    }

    pub fn end_scan(&mut self) {
        self.in_flight = false;
    }

    pub fn disconnect(&mut self, timers: &mut Timers) {
        self.connected = false;
        if let Some(pending) = self.pending.take() {
            timers.cancel(pending);
        }
    }
}
