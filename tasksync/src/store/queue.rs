//! Durable, ordered queue of pending actions.
//!
//! The [`QueueStore`] keeps an in-memory mirror of the queue for fast reads.
//! Every mutation is written to [`Storage`] first and only then applied to
//! the mirror, so the mirror never shows a state that would be lost on
//! restart. Insertion order is replay order; status and payload updates
//! never move a record.
//!
//! Mutations are serialized: the existence check, the durable write and
//! the mirror update of one mutation never interleave with another, so a
//! removed record cannot be written back by an update that was already in
//! flight.

use parking_lot::RwLock;
use tokio::sync::Mutex;

use tasksync_proto::codec;
use tasksync_proto::entity::{EntityId, EntityKind};
use tasksync_proto::pending::{ActionId, ActionStatus, PendingAction};

use super::{Namespace, Storage, StoreError, WriteBatch};

/// Ordered store of [`PendingAction`] records.
pub struct QueueStore<S: Storage> {
    storage: S,
    /// Mirror of the durable queue, in insertion order.
    actions: RwLock<Vec<PendingAction>>,
    /// Held across every mutation.
    writes: Mutex<()>,
}

impl<S: Storage> QueueStore<S> {
    /// Loads the queue from storage.
    ///
    /// Records that fail to decode (for example an action kind this build
    /// does not know) are logged and removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the storage scan fails.
    pub async fn open(storage: S) -> Result<Self, StoreError> {
        let rows = storage.scan(Namespace::Queue).await?;
        let mut actions = Vec::with_capacity(rows.len());
        let mut dropped = WriteBatch::new();
        for (key, bytes) in rows {
            match codec::decode::<PendingAction>(&bytes) {
                Ok(action) => actions.push(action),
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "dropping undecodable queue record");
                    dropped = dropped.delete(key);
                }
            }
        }
        if !dropped.is_empty() {
            storage.write_batch(Namespace::Queue, dropped).await?;
        }
        tracing::debug!(pending = actions.len(), "queue loaded");
        Ok(Self {
            storage,
            actions: RwLock::new(actions),
            writes: Mutex::new(()),
        })
    }

    /// Appends an action. Returns only once the record is durable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if encoding or the durable write fails; the
    /// action is then not queued.
    pub async fn enqueue(&self, action: PendingAction) -> Result<(), StoreError> {
        let _writes = self.writes.lock().await;
        let bytes = codec::encode(&action)?;
        self.storage
            .put(Namespace::Queue, action.id.to_string(), bytes)
            .await?;
        self.actions.write().push(action);
        Ok(())
    }

    /// Returns every queued action in insertion order.
    #[must_use]
    pub fn list(&self) -> Vec<PendingAction> {
        self.actions.read().clone()
    }

    /// Returns the ids of every queued action in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<ActionId> {
        self.actions.read().iter().map(|a| a.id.clone()).collect()
    }

    /// Returns one queued action.
    #[must_use]
    pub fn get(&self, id: &ActionId) -> Option<PendingAction> {
        self.actions.read().iter().find(|a| a.id == *id).cloned()
    }

    /// Returns the number of queued actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.read().len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.read().is_empty()
    }

    /// Returns the smallest temp id any queued creation still carries.
    #[must_use]
    pub fn min_temp_id(&self) -> Option<EntityId> {
        self.actions.read().iter().filter_map(|a| a.temp_id).min()
    }

    /// Persists a modified record in place.
    ///
    /// Updating an id that is no longer queued is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if encoding or the durable write fails.
    pub async fn update(&self, action: &PendingAction) -> Result<(), StoreError> {
        let _writes = self.writes.lock().await;
        self.persist(action).await?;
        Ok(())
    }

    /// Writes `action` over its queued record. Callers hold `writes`.
    ///
    /// Returns `false` without writing if the record is gone.
    async fn persist(&self, action: &PendingAction) -> Result<bool, StoreError> {
        if self.get(&action.id).is_none() {
            return Ok(false);
        }
        let bytes = codec::encode(action)?;
        self.storage
            .put(Namespace::Queue, action.id.to_string(), bytes)
            .await?;
        if let Some(slot) = self.actions.write().iter_mut().find(|a| a.id == action.id) {
            slot.clone_from(action);
        }
        Ok(true)
    }

    /// Reads, modifies and persists one record.
    ///
    /// Returns the updated record, or `None` if `id` is not queued.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the durable write fails.
    pub async fn modify<F>(&self, id: &ActionId, f: F) -> Result<Option<PendingAction>, StoreError>
    where
        F: FnOnce(&mut PendingAction),
    {
        let _writes = self.writes.lock().await;
        let Some(mut action) = self.get(id) else {
            return Ok(None);
        };
        f(&mut action);
        self.persist(&action).await?;
        Ok(Some(action))
    }

    /// Sets the replay status (and failure reason) of one record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the durable write fails.
    pub async fn update_status(
        &self,
        id: &ActionId,
        status: ActionStatus,
        reason: Option<String>,
    ) -> Result<Option<PendingAction>, StoreError> {
        self.modify(id, |action| {
            action.status = status;
            action.failure_reason = reason;
        })
        .await
    }

    /// Removes one record. Removing an unknown id is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the durable delete fails.
    pub async fn remove(&self, id: &ActionId) -> Result<(), StoreError> {
        let _writes = self.writes.lock().await;
        self.storage
            .delete(Namespace::Queue, id.to_string())
            .await?;
        self.actions.write().retain(|a| a.id != *id);
        Ok(())
    }

    /// Rewrites every reference to `from` as `to` in all queued actions
    /// except `except`, persisting each record that changed.
    ///
    /// Returns the number of records rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any durable write fails; records rewritten
    /// before the failure stay rewritten.
    pub async fn remap_ids(
        &self,
        except: &ActionId,
        from: EntityId,
        to: EntityId,
    ) -> Result<usize, StoreError> {
        let _writes = self.writes.lock().await;
        let mut changed = Vec::new();
        for mut action in self.list() {
            if action.id == *except {
                continue;
            }
            if action.action.remap_id(from, to) > 0 {
                changed.push(action);
            }
        }
        for action in &changed {
            tracing::debug!(
                action_id = %action.id,
                kind = %action.kind(),
                from = %from,
                to = %to,
                "rewrote temp id reference"
            );
            self.persist(action).await?;
        }
        Ok(changed.len())
    }

    /// Moves the concurrency guard of queued updates to `target` from
    /// `seen` to `now`, skipping `except`.
    ///
    /// Used once this client's own update to `target` is acknowledged, so
    /// that later queued edits made against the same version do not
    /// conflict with it. Returns the number of records rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any durable write fails.
    pub async fn advance_guards(
        &self,
        except: &ActionId,
        kind: EntityKind,
        target: EntityId,
        seen: u64,
        now: u64,
    ) -> Result<usize, StoreError> {
        let _writes = self.writes.lock().await;
        let mut changed = Vec::new();
        for mut action in self.list() {
            if action.id == *except
                || action.kind().entity_kind() != kind
                || action.action.target() != Some(target)
                || action.action.expected_updated_at() != Some(seen)
            {
                continue;
            }
            action.action.strip_guard();
            action.action.attach_guard(now);
            changed.push(action);
        }
        for action in &changed {
            self.persist(action).await?;
        }
        if !changed.is_empty() {
            tracing::debug!(
                entity = %target,
                seen,
                now,
                rewritten = changed.len(),
                "advanced queued guards"
            );
        }
        Ok(changed.len())
    }
}
