//! Online state and replay triggers.

use tokio::sync::watch;

/// External notifications that may start a queue replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The network went up (`true`) or down (`false`).
    Online(bool),
    /// The window regained focus.
    Focus,
    /// The document became visible (`true`) or hidden (`false`).
    Visible(bool),
}

impl Signal {
    /// Returns `true` if this signal should start a replay when online.
    #[must_use]
    pub const fn triggers_replay(self) -> bool {
        matches!(self, Self::Online(true) | Self::Focus | Self::Visible(true))
    }
}

/// Shared online flag with change notification.
#[derive(Debug)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    /// Creates the flag with an initial state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Returns the current state.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Sets the state. Returns `true` if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        })
    }

    /// Subscribe to state changes (for an offline banner).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
