//! Optimistic in-memory caches of tasks, lists and labels.
//!
//! A [`DomainCache`] is an `id -> entity` map with a write-through durable
//! copy. Every mutation updates the map synchronously (reads are immediately
//! consistent) and then awaits the durable write through the shared
//! [`WriteThrough`] supervisor. A failed durable write is logged and retried,
//! never rolled back: the in-memory state is authoritative for the session.
//!
//! Derived indexes plug in through [`CacheIndex`]; the task cache uses
//! [`SubtaskIndex`](task::SubtaskIndex) to resolve a subtask's owner in
//! constant time.

pub mod task;
pub mod writer;

pub use task::{SubtaskIndex, TaskCache};
pub use writer::{PersistWarning, WriteThrough};

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use tasksync_proto::codec;
use tasksync_proto::entity::{EntityId, Label, Task, TaskList};

use crate::store::{Namespace, Storage, StoreError, WriteBatch};

/// An entity that can live in a [`DomainCache`].
pub trait Cached: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Namespace the durable copy is stored under.
    const NAMESPACE: Namespace;

    /// Returns the entity's id.
    fn id(&self) -> EntityId;

    /// Returns the last known server modification time.
    fn updated_at(&self) -> Option<u64>;

    /// Rewrites references this entity holds to other entities.
    ///
    /// Returns `true` if anything changed.
    fn remap_refs(&mut self, _from: EntityId, _to: EntityId) -> bool {
        false
    }
}

impl Cached for Task {
    const NAMESPACE: Namespace = Namespace::Tasks;

    fn id(&self) -> EntityId {
        self.id
    }

    fn updated_at(&self) -> Option<u64> {
        self.updated_at
    }

    fn remap_refs(&mut self, from: EntityId, to: EntityId) -> bool {
        let mut changed = false;
        if let Some(list_id) = &mut self.list_id {
            changed |= list_id.remap(from, to);
        }
        for label_id in &mut self.label_ids {
            changed |= label_id.remap(from, to);
        }
        for subtask in &mut self.subtasks {
            changed |= subtask.task_id.remap(from, to);
        }
        changed
    }
}

impl Cached for TaskList {
    const NAMESPACE: Namespace = Namespace::Lists;

    fn id(&self) -> EntityId {
        self.id
    }

    fn updated_at(&self) -> Option<u64> {
        self.updated_at
    }
}

impl Cached for Label {
    const NAMESPACE: Namespace = Namespace::Labels;

    fn id(&self) -> EntityId {
        self.id
    }

    fn updated_at(&self) -> Option<u64> {
        self.updated_at
    }
}

/// A derived index maintained alongside a cache's entries.
pub trait CacheIndex<E>: Default + Send + Sync + 'static {
    /// Called after `entity` is stored.
    fn insert(&mut self, entity: &E);
    /// Called after `entity` is removed (or before it is replaced).
    fn remove(&mut self, entity: &E);
    /// Called when the cache is wiped.
    fn clear(&mut self);
}

/// Index that tracks nothing.
#[derive(Debug, Default)]
pub struct NoIndex;

impl<E> CacheIndex<E> for NoIndex {
    fn insert(&mut self, _entity: &E) {}
    fn remove(&mut self, _entity: &E) {}
    fn clear(&mut self) {}
}

/// Entries plus their derived index, guarded together.
struct CacheState<E, I> {
    entries: HashMap<EntityId, E>,
    index: I,
}

impl<E: Cached, I: CacheIndex<E>> CacheState<E, I> {
    fn insert(&mut self, entity: E) {
        if let Some(old) = self.entries.remove(&entity.id()) {
            self.index.remove(&old);
        }
        self.index.insert(&entity);
        self.entries.insert(entity.id(), entity);
    }

    fn remove(&mut self, id: EntityId) -> Option<E> {
        let old = self.entries.remove(&id)?;
        self.index.remove(&old);
        Some(old)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

/// In-memory `id -> entity` map with write-through persistence.
pub struct DomainCache<E, S: Storage, I = NoIndex> {
    state: RwLock<CacheState<E, I>>,
    writer: Arc<WriteThrough<S>>,
    _entity: PhantomData<fn() -> E>,
}

/// Cache of task lists.
pub type ListCache<S> = DomainCache<TaskList, S>;

/// Cache of labels.
pub type LabelCache<S> = DomainCache<Label, S>;

/// Encodes one entity as a put op, logging (and skipping) encode failures.
fn put_op<E: Cached>(batch: WriteBatch, entity: &E) -> WriteBatch {
    match codec::encode(entity) {
        Ok(bytes) => batch.put(entity.id().to_string(), bytes),
        Err(err) => {
            tracing::warn!(
                namespace = %E::NAMESPACE,
                id = %entity.id(),
                error = %err,
                "cannot encode cache entry; not persisted"
            );
            batch
        }
    }
}

impl<E: Cached, S: Storage, I: CacheIndex<E>> DomainCache<E, S, I> {
    /// Creates an empty cache persisting through `writer`.
    #[must_use]
    pub fn new(writer: Arc<WriteThrough<S>>) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                index: I::default(),
            }),
            writer,
            _entity: PhantomData,
        }
    }

    /// Loads the durable copy into memory.
    ///
    /// Entries already in memory win over their durable counterparts.
    /// Returns the number of entries loaded from storage.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the storage scan fails.
    pub async fn initialize(&self) -> Result<usize, StoreError> {
        let rows = self.writer.storage().scan(E::NAMESPACE).await?;
        let mut decoded = Vec::with_capacity(rows.len());
        for (key, bytes) in rows {
            match codec::decode::<E>(&bytes) {
                Ok(entity) => decoded.push(entity),
                Err(err) => {
                    tracing::warn!(
                        namespace = %E::NAMESPACE,
                        key = %key,
                        error = %err,
                        "skipping undecodable cache record"
                    );
                }
            }
        }

        let mut state = self.state.write();
        let mut loaded = 0;
        for entity in decoded {
            if !state.entries.contains_key(&entity.id()) {
                state.insert(entity);
                loaded += 1;
            }
        }
        drop(state);
        tracing::debug!(namespace = %E::NAMESPACE, loaded, "cache initialized");
        Ok(loaded)
    }

    /// Authoritative full resync: the cache becomes exactly `entities`.
    pub async fn replace_all(&self, entities: Vec<E>) {
        let batch = entities.iter().fold(WriteBatch::replace_all(), put_op);
        {
            let mut state = self.state.write();
            state.clear();
            for entity in entities {
                state.insert(entity);
            }
        }
        self.writer.write(E::NAMESPACE, batch).await;
    }

    /// Inserts or replaces one entity.
    pub async fn upsert_one(&self, entity: E) {
        self.upsert_many(vec![entity]).await;
    }

    /// Inserts or replaces several entities.
    pub async fn upsert_many(&self, entities: Vec<E>) {
        if entities.is_empty() {
            return;
        }
        let batch = entities.iter().fold(WriteBatch::new(), put_op);
        {
            let mut state = self.state.write();
            for entity in entities {
                state.insert(entity);
            }
        }
        self.writer.write(E::NAMESPACE, batch).await;
    }

    /// Removes one entity. Returns it if it was cached.
    pub async fn delete_one(&self, id: EntityId) -> Option<E> {
        self.delete_many(&[id]).await.pop()
    }

    /// Removes several entities. Returns the ones that were cached.
    pub async fn delete_many(&self, ids: &[EntityId]) -> Vec<E> {
        if ids.is_empty() {
            return Vec::new();
        }
        let removed: Vec<E> = {
            let mut state = self.state.write();
            ids.iter().filter_map(|id| state.remove(*id)).collect()
        };
        let batch = ids
            .iter()
            .fold(WriteBatch::new(), |batch, id| batch.delete(id.to_string()));
        self.writer.write(E::NAMESPACE, batch).await;
        removed
    }

    /// Atomically swaps the entry keyed `old_id` for `entity`.
    ///
    /// `carry` sees the old entry (if any) and may copy local-only state
    /// into the replacement. Memory and durable state change in one step:
    /// there is never a moment where both ids are present.
    pub async fn replace_id<F>(&self, old_id: EntityId, mut entity: E, carry: F)
    where
        F: FnOnce(&E, &mut E),
    {
        {
            let mut state = self.state.write();
            if let Some(old) = state.remove(old_id) {
                carry(&old, &mut entity);
            }
            state.insert(entity.clone());
        }
        let batch = put_op(WriteBatch::new().delete(old_id.to_string()), &entity);
        self.writer.write(E::NAMESPACE, batch).await;
    }

    /// Applies `f` to one cached entity and persists the result.
    ///
    /// Returns the updated entity, or `None` if `id` is not cached.
    pub async fn modify<F>(&self, id: EntityId, f: F) -> Option<E>
    where
        F: FnOnce(&mut E),
    {
        let updated = {
            let mut state = self.state.write();
            let mut entity = state.entries.get(&id)?.clone();
            f(&mut entity);
            state.insert(entity.clone());
            entity
        };
        self.writer
            .write(E::NAMESPACE, put_op(WriteBatch::new(), &updated))
            .await;
        Some(updated)
    }

    /// Rewrites references to `from` held by cached entities.
    ///
    /// Returns the number of entities that changed.
    pub async fn remap_refs(&self, from: EntityId, to: EntityId) -> usize {
        let changed: Vec<E> = {
            let mut state = self.state.write();
            let mut changed = Vec::new();
            for entity in state.entries.values_mut() {
                if entity.remap_refs(from, to) {
                    changed.push(entity.clone());
                }
            }
            // Index entries may key on the rewritten fields.
            for entity in &changed {
                state.insert(entity.clone());
            }
            changed
        };
        let count = changed.len();
        if count > 0 {
            let batch = changed.iter().fold(WriteBatch::new(), put_op);
            self.writer.write(E::NAMESPACE, batch).await;
        }
        count
    }

    /// Returns a copy of one entity.
    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<E> {
        self.state.read().entries.get(&id).cloned()
    }

    /// Returns `true` if `id` is cached.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.state.read().entries.contains_key(&id)
    }

    /// Returns every cached entity, ordered by id.
    #[must_use]
    pub fn all(&self) -> Vec<E> {
        let mut all: Vec<E> = self.state.read().entries.values().cloned().collect();
        all.sort_by_key(Cached::id);
        all
    }

    /// Returns the number of cached entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Runs `f` with read access to the derived index.
    pub fn with_index<R>(&self, f: impl FnOnce(&I) -> R) -> R {
        f(&self.state.read().index)
    }
}
