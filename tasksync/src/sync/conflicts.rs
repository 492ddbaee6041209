//! Bounded list of unresolved conflicts awaiting a user decision.
//!
//! Entries are kept in detection order; the first one is the "current"
//! conflict a UI would present. Each entry is keyed by its action id, so a
//! repeated conflict for the same action replaces its entry in place. When
//! the list is full the oldest entry is evicted; the evicted action stays
//! queued as failed and re-surfaces on the next replay.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::watch;

use tasksync_proto::pending::{ActionId, ConflictInfo};

/// Default capacity of the conflict list.
pub const DEFAULT_MAX_CONFLICTS: usize = 100;

/// Ordered, bounded set of [`ConflictInfo`] entries.
pub struct ConflictSurface {
    entries: Mutex<VecDeque<ConflictInfo>>,
    capacity: usize,
    /// Carries the current entry count.
    notify: watch::Sender<usize>,
}

impl ConflictSurface {
    /// Creates an empty surface holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (notify, _rx) = watch::channel(0);
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify,
        }
    }

    /// Records a conflict. Returns the entry evicted to make room, if any.
    pub fn record(&self, info: ConflictInfo) -> Option<ConflictInfo> {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.iter_mut().find(|c| c.action_id == info.action_id) {
            *slot = info;
            return None;
        }
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(info);
        let len = entries.len();
        drop(entries);

        if let Some(evicted) = &evicted {
            tracing::warn!(
                action_id = %evicted.action_id,
                capacity = self.capacity,
                "conflict list full; oldest entry evicted"
            );
        }
        self.notify.send_replace(len);
        evicted
    }

    /// Removes and returns the conflict for `action_id`.
    ///
    /// Returns `None` if there is none (including when it was already taken).
    pub fn take(&self, action_id: &ActionId) -> Option<ConflictInfo> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|c| c.action_id == *action_id)?;
        let taken = entries.remove(pos);
        let len = entries.len();
        drop(entries);
        self.notify.send_replace(len);
        taken
    }

    /// Returns the conflict for `action_id` without removing it.
    #[must_use]
    pub fn get(&self, action_id: &ActionId) -> Option<ConflictInfo> {
        self.entries
            .lock()
            .iter()
            .find(|c| c.action_id == *action_id)
            .cloned()
    }

    /// Returns `true` if `action_id` has an unresolved conflict.
    #[must_use]
    pub fn contains(&self, action_id: &ActionId) -> bool {
        self.entries.lock().iter().any(|c| c.action_id == *action_id)
    }

    /// Returns the conflict a UI should present first.
    #[must_use]
    pub fn current(&self) -> Option<ConflictInfo> {
        self.entries.lock().front().cloned()
    }

    /// Returns every unresolved conflict in detection order.
    #[must_use]
    pub fn list(&self) -> Vec<ConflictInfo> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Returns the number of unresolved conflicts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if there are no unresolved conflicts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Subscribe to the conflict count (for a badge).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.notify.subscribe()
    }
}

impl Default for ConflictSurface {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONFLICTS)
    }
}
