//! The queue and caches an engine operates on.
//!
//! A [`SyncContext`] bundles the Durable Queue Store with the three Domain
//! Caches over one storage backend. Each engine owns its context, so tests
//! (and multiple engines in one process) never share hidden state.

use std::sync::Arc;

use tokio::sync::mpsc;

use tasksync_proto::action::Action;
use tasksync_proto::entity::{Entity, EntityId, EntityKind, Label, Snapshot, Subtask, TaskList};

use crate::cache::{DomainCache, LabelCache, ListCache, PersistWarning, TaskCache, WriteThrough};
use crate::store::{QueueStore, Storage, StoreError};

/// Queue plus domain caches sharing one storage backend.
pub struct SyncContext<S: Storage> {
    /// Pending actions in replay order.
    pub queue: QueueStore<S>,
    /// Tasks and their subtasks.
    pub tasks: TaskCache<S>,
    /// Task lists.
    pub lists: ListCache<S>,
    /// Labels.
    pub labels: LabelCache<S>,
    writer: Arc<WriteThrough<S>>,
}

impl<S: Storage> SyncContext<S> {
    /// Opens the queue and builds empty caches over `storage`.
    ///
    /// Caches are not loaded until [`initialize`](Self::initialize).
    /// Returns the context and a receiver for cache [`PersistWarning`]s.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the queue cannot be loaded.
    pub async fn open(
        storage: S,
        warning_buffer: usize,
    ) -> Result<(Self, mpsc::Receiver<PersistWarning>), StoreError> {
        let queue = QueueStore::open(storage.clone()).await?;
        let (writer, warnings) = WriteThrough::new(storage, warning_buffer);
        let writer = Arc::new(writer);
        let ctx = Self {
            queue,
            tasks: DomainCache::new(Arc::clone(&writer)),
            lists: DomainCache::new(Arc::clone(&writer)),
            labels: DomainCache::new(Arc::clone(&writer)),
            writer,
        };
        Ok((ctx, warnings))
    }

    /// Returns the shared write-through supervisor.
    #[must_use]
    pub const fn writer(&self) -> &Arc<WriteThrough<S>> {
        &self.writer
    }

    /// Returns the storage backend.
    #[must_use]
    pub fn storage(&self) -> &S {
        self.writer.storage()
    }

    /// Loads every cache from storage. Returns the number of entries loaded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any cache scan fails.
    pub async fn initialize(&self) -> Result<usize, StoreError> {
        let tasks = self.tasks.initialize().await?;
        let lists = self.lists.initialize().await?;
        let labels = self.labels.initialize().await?;
        Ok(tasks + lists + labels)
    }

    /// Replaces every cache with a server snapshot.
    pub async fn replace_all(&self, snapshot: Snapshot) {
        self.tasks.replace_all(snapshot.tasks).await;
        self.lists.replace_all(snapshot.lists).await;
        self.labels.replace_all(snapshot.labels).await;
    }

    /// Returns the last known server modification time of an entity.
    #[must_use]
    pub fn updated_at(&self, kind: EntityKind, id: EntityId) -> Option<u64> {
        match kind {
            EntityKind::Task => self.tasks.get(id)?.updated_at,
            EntityKind::List => self.lists.get(id)?.updated_at,
            EntityKind::Label => self.labels.get(id)?.updated_at,
            EntityKind::Subtask => None,
        }
    }

    /// Returns a copy of a cached entity.
    #[must_use]
    pub fn entity(&self, kind: EntityKind, id: EntityId) -> Option<Entity> {
        match kind {
            EntityKind::Task => self.tasks.get(id).map(Entity::Task),
            EntityKind::Subtask => self.tasks.subtask(id).map(Entity::Subtask),
            EntityKind::List => self.lists.get(id).map(Entity::List),
            EntityKind::Label => self.labels.get(id).map(Entity::Label),
        }
    }

    /// Stores an authoritative server copy.
    pub async fn apply_entity(&self, entity: Entity) {
        match entity {
            Entity::Task(task) => self.tasks.replace_task_id(task.id, task).await,
            Entity::Subtask(subtask) => {
                if !self.tasks.upsert_subtask(subtask.clone()).await {
                    tracing::debug!(
                        subtask = %subtask.id,
                        task = %subtask.task_id,
                        "parent task not cached; subtask not stored"
                    );
                }
            }
            Entity::List(list) => self.lists.upsert_one(list).await,
            Entity::Label(label) => self.labels.upsert_one(label).await,
        }
    }

    /// Removes an entity from its cache.
    pub async fn remove_entity(&self, kind: EntityKind, id: EntityId) {
        match kind {
            EntityKind::Task => {
                self.tasks.delete_one(id).await;
            }
            EntityKind::Subtask => {
                self.tasks.delete_subtask(id).await;
            }
            EntityKind::List => {
                self.lists.delete_one(id).await;
            }
            EntityKind::Label => {
                self.labels.delete_one(id).await;
            }
        }
    }

    /// Swaps the temp-id entry for its acknowledged server copy.
    pub async fn replace_id(&self, temp_id: EntityId, entity: Entity) {
        match entity {
            Entity::Task(task) => self.tasks.replace_task_id(temp_id, task).await,
            Entity::Subtask(subtask) => {
                self.tasks.replace_subtask_id(temp_id, subtask).await;
            }
            Entity::List(list) => self.lists.replace_id(temp_id, list, |_, _| {}).await,
            Entity::Label(label) => self.labels.replace_id(temp_id, label, |_, _| {}).await,
        }
    }

    /// Rewrites cross-entity references to `from` in every cache.
    ///
    /// Returns the number of entities that changed.
    pub async fn remap_refs(&self, from: EntityId, to: EntityId) -> usize {
        self.tasks.remap_refs(from, to).await
            + self.lists.remap_refs(from, to).await
            + self.labels.remap_refs(from, to).await
    }

    /// Applies a freshly dispatched action to the caches.
    ///
    /// Creations are stored under `temp_id`; updates merge into the cached
    /// entity; deletions remove it. Returns the optimistic entity, if any.
    pub async fn apply_optimistic(&self, action: &Action, temp_id: Option<EntityId>) -> Option<Entity> {
        let new_id = temp_id.unwrap_or(EntityId::new(0));
        match action {
            Action::CreateTask(draft) => {
                let task = draft.to_task(new_id);
                self.tasks.upsert_one(task.clone()).await;
                Some(Entity::Task(task))
            }
            Action::UpdateTask(update) => self
                .tasks
                .modify(update.id, |task| update.patch.apply_to(task))
                .await
                .map(Entity::Task),
            Action::DeleteTask(id) => self.tasks.delete_one(*id).await.map(Entity::Task),
            Action::CreateSubtask(draft) => {
                let subtask = Subtask {
                    id: new_id,
                    task_id: draft.task_id,
                    title: draft.title.clone(),
                    completed: false,
                };
                self.tasks.upsert_subtask(subtask.clone()).await;
                Some(Entity::Subtask(subtask))
            }
            Action::UpdateSubtask(update) => self
                .tasks
                .modify_subtask(update.id, |subtask| update.patch.apply_to(subtask))
                .await
                .map(Entity::Subtask),
            Action::DeleteSubtask(id) => self.tasks.delete_subtask(*id).await.map(Entity::Subtask),
            Action::CreateList(draft) => {
                let list = TaskList {
                    id: new_id,
                    name: draft.name.clone(),
                    color: draft.color.clone(),
                    updated_at: None,
                };
                self.lists.upsert_one(list.clone()).await;
                Some(Entity::List(list))
            }
            Action::UpdateList(update) => self
                .lists
                .modify(update.id, |list| update.patch.apply_to_list(list))
                .await
                .map(Entity::List),
            Action::DeleteList(id) => self.lists.delete_one(*id).await.map(Entity::List),
            Action::CreateLabel(draft) => {
                let label = Label {
                    id: new_id,
                    name: draft.name.clone(),
                    color: draft.color.clone(),
                    updated_at: None,
                };
                self.labels.upsert_one(label.clone()).await;
                Some(Entity::Label(label))
            }
            Action::UpdateLabel(update) => self
                .labels
                .modify(update.id, |label| update.patch.apply_to_label(label))
                .await
                .map(Entity::Label),
            Action::DeleteLabel(id) => self.labels.delete_one(*id).await.map(Entity::Label),
        }
    }
}
