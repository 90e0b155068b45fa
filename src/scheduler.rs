use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::dom::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Work the event loop runs when a timer comes due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// First scan after the page's own rendering settles.
    StartupScan,
    /// Scan at the end of a mutation debounce window.
    DebouncedScan,
    /// Second half of a retirement: hide the faded-out post.
    FinishRetire(NodeId),
    /// Bring up a fresh session after in-app navigation.
    Reinitialize,
}

/// Single-threaded timer queue on a virtual clock.
///
/// Timers with the same deadline fire in scheduling order.
#[derive(Debug, Default)]
pub struct Timers {
    now: Duration,
    next_seq: u64,
    queue: BTreeMap<(Duration, u64), Task>,
    deadlines: HashMap<TimerId, Duration>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn schedule(&mut self, delay: Duration, task: Task) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let deadline = self.now + delay;
        self.queue.insert((deadline, seq), task);
        let id = TimerId(seq);
        self.deadlines.insert(id, deadline);
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<Task> {
        let deadline = self.deadlines.remove(&id)?;
        self.queue.remove(&(deadline, id.0))
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes the earliest timer due at or before `until` and moves the clock
    /// to its deadline.
    pub fn pop_due(&mut self, until: Duration) -> Option<(TimerId, Task)> {
        let (&(deadline, seq), _) = self.queue.first_key_value()?;
        if deadline > until {
            return None;
        }
        let task = self.queue.remove(&(deadline, seq))?;
        let id = TimerId(seq);
        self.deadlines.remove(&id);
        self.now = self.now.max(deadline);
        Some((id, task))
    }

    /// Moves the clock forward without firing anything.
    pub fn advance_to(&mut self, at: Duration) {
        self.now = self.now.max(at);
    }
}
