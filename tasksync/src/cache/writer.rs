//! Supervised write-through from the domain caches to durable storage.
//!
//! [`WriteThrough`] wraps any [`Storage`] so that cache persistence failures
//! are handled in one place instead of being dropped on the floor.
//!
//! # Write failure handling
//!
//! If a durable write fails (disk full, database locked, etc.):
//! 1. The error is logged (never crashes the application).
//! 2. The in-memory cache keeps the new state; nothing is rolled back.
//! 3. The failed batch is queued for retry.
//! 4. A [`PersistWarning`] is emitted so the UI can show a non-blocking notice.
//!
//! A newer write to the same key supersedes a queued retry. Writes and
//! retry flushes hold the retry queue's lock across the durable write, so
//! they land in the order they were issued and a retry never lands after
//! a newer write.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::store::{Namespace, Storage, StoreError, WriteBatch};

/// Warning emitted when a cache write could not be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistWarning {
    /// Namespace the write targeted.
    pub namespace: Namespace,
    /// Description of the error.
    pub reason: String,
}

/// Persists cache mutations, retrying the ones that fail.
pub struct WriteThrough<S: Storage> {
    /// The underlying store.
    storage: S,
    /// Batches that need to be retried, oldest first. Held across every
    /// durable write.
    pending: Mutex<VecDeque<(Namespace, WriteBatch)>>,
    /// Channel for emitting warnings to the UI layer.
    warning_tx: mpsc::Sender<PersistWarning>,
}

impl<S: Storage> WriteThrough<S> {
    /// Create a new writer over the given storage.
    ///
    /// Returns the writer and a receiver for [`PersistWarning`] events.
    #[must_use]
    pub fn new(storage: S, warning_buffer: usize) -> (Self, mpsc::Receiver<PersistWarning>) {
        let (tx, rx) = mpsc::channel(warning_buffer.max(1));
        let writer = Self {
            storage,
            pending: Mutex::new(VecDeque::new()),
            warning_tx: tx,
        };
        (writer, rx)
    }

    /// Returns the wrapped storage (reads bypass the writer).
    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// Writes a batch, handling failure without surfacing it.
    ///
    /// Returns `true` if the batch is durable now.
    pub async fn write(&self, ns: Namespace, batch: WriteBatch) -> bool {
        if batch.is_empty() {
            return true;
        }
        let mut pending = self.pending.lock().await;
        supersede(&mut pending, ns, &batch);
        match self.storage.write_batch(ns, batch.clone()).await {
            Ok(()) => true,
            Err(err) => {
                self.record_failure(&mut pending, ns, batch, &err);
                false
            }
        }
    }

    fn record_failure(
        &self,
        pending: &mut VecDeque<(Namespace, WriteBatch)>,
        ns: Namespace,
        batch: WriteBatch,
        err: &StoreError,
    ) {
        tracing::warn!(
            namespace = %ns,
            error = %err,
            "cache write-through failed; in-memory state kept"
        );
        pending.push_back((ns, batch));

        // Best-effort warning emission; if the channel is full, drop it.
        let _ = self.warning_tx.try_send(PersistWarning {
            namespace: ns,
            reason: err.to_string(),
        });
    }

    /// Attempt to flush all pending writes through the store.
    ///
    /// Returns the number of batches successfully written.
    pub async fn flush_pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let batches = std::mem::take(&mut *pending);

        let total = batches.len();
        let mut succeeded = 0;

        for (ns, batch) in batches {
            if self.storage.write_batch(ns, batch.clone()).await.is_ok() {
                succeeded += 1;
            } else {
                pending.push_back((ns, batch));
            }
        }

        if succeeded > 0 {
            tracing::info!(
                succeeded,
                remaining = total - succeeded,
                "flushed pending cache writes"
            );
        }

        succeeded
    }

    /// Return the number of batches awaiting retry.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Spawn a background task that periodically flushes pending writes.
    ///
    /// The task runs every `interval` and stops when the returned
    /// [`tokio::task::JoinHandle`] is aborted or the runtime shuts down.
    pub fn spawn_retry_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let writer = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if writer.pending_count().await > 0 {
                    writer.flush_pending().await;
                }
            }
        })
    }
}

/// Drops the parts of queued retries that `batch` makes obsolete.
fn supersede(pending: &mut VecDeque<(Namespace, WriteBatch)>, ns: Namespace, batch: &WriteBatch) {
    for (queued_ns, queued) in pending.iter_mut() {
        if *queued_ns == ns {
            queued.supersede_with(batch);
        }
    }
    pending.retain(|(_, queued)| !queued.is_empty());
}
