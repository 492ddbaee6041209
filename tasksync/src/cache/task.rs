//! Task cache with a subtask → parent index.
//!
//! Subtasks live inside their parent [`Task`]. The [`SubtaskIndex`] is kept
//! in step with every upsert and delete so that a subtask-targeted action
//! finds its owner without scanning every task.

use std::collections::HashMap;

use tasksync_proto::entity::{EntityId, Subtask, Task};

use super::{CacheIndex, DomainCache};
use crate::store::Storage;

/// Cache of tasks (and, nested inside them, subtasks).
pub type TaskCache<S> = DomainCache<Task, S, SubtaskIndex>;

/// Maps subtask ids to the id of the task that owns them.
#[derive(Debug, Default)]
pub struct SubtaskIndex {
    parents: HashMap<EntityId, EntityId>,
}

impl SubtaskIndex {
    /// Returns the owning task of `subtask_id`.
    #[must_use]
    pub fn parent_of(&self, subtask_id: EntityId) -> Option<EntityId> {
        self.parents.get(&subtask_id).copied()
    }

    /// Returns the number of indexed subtasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// Returns `true` if no subtasks are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

impl CacheIndex<Task> for SubtaskIndex {
    fn insert(&mut self, task: &Task) {
        for subtask in &task.subtasks {
            self.parents.insert(subtask.id, task.id);
        }
    }

    fn remove(&mut self, task: &Task) {
        for subtask in &task.subtasks {
            if self.parents.get(&subtask.id) == Some(&task.id) {
                self.parents.remove(&subtask.id);
            }
        }
    }

    fn clear(&mut self) {
        self.parents.clear();
    }
}

impl<S: Storage> DomainCache<Task, S, SubtaskIndex> {
    /// Returns the owning task of a subtask in constant time.
    #[must_use]
    pub fn parent_of(&self, subtask_id: EntityId) -> Option<EntityId> {
        self.with_index(|index| index.parent_of(subtask_id))
    }

    /// Returns a copy of one subtask.
    #[must_use]
    pub fn subtask(&self, subtask_id: EntityId) -> Option<Subtask> {
        let parent = self.parent_of(subtask_id)?;
        self.get(parent)?
            .subtasks
            .into_iter()
            .find(|s| s.id == subtask_id)
    }

    /// Inserts or replaces a subtask inside its parent task.
    ///
    /// Returns `false` if the parent task is not cached.
    pub async fn upsert_subtask(&self, subtask: Subtask) -> bool {
        // A subtask moving between parents leaves its old owner first.
        if let Some(old_parent) = self.parent_of(subtask.id)
            && old_parent != subtask.task_id
        {
            let id = subtask.id;
            self.modify(old_parent, |task| task.subtasks.retain(|s| s.id != id))
                .await;
        }
        self.modify(subtask.task_id, |task| {
            match task.subtasks.iter_mut().find(|s| s.id == subtask.id) {
                Some(slot) => *slot = subtask,
                None => task.subtasks.push(subtask),
            }
        })
        .await
        .is_some()
    }

    /// Applies `f` to one subtask, persisting the owning task.
    pub async fn modify_subtask<F>(&self, subtask_id: EntityId, f: F) -> Option<Subtask>
    where
        F: FnOnce(&mut Subtask),
    {
        let parent = self.parent_of(subtask_id)?;
        let mut updated = None;
        self.modify(parent, |task| {
            if let Some(subtask) = task.subtasks.iter_mut().find(|s| s.id == subtask_id) {
                f(subtask);
                updated = Some(subtask.clone());
            }
        })
        .await;
        updated
    }

    /// Removes one subtask from its owner. Returns it if it was cached.
    pub async fn delete_subtask(&self, subtask_id: EntityId) -> Option<Subtask> {
        let parent = self.parent_of(subtask_id)?;
        let mut removed = None;
        self.modify(parent, |task| {
            if let Some(pos) = task.subtasks.iter().position(|s| s.id == subtask_id) {
                removed = Some(task.subtasks.remove(pos));
            }
        })
        .await;
        removed
    }

    /// Swaps a temp-id subtask for its acknowledged counterpart.
    ///
    /// Returns `false` if no cached task owns `temp_id`; the acknowledged
    /// subtask is still inserted if its parent is cached.
    ///
    /// When the owner is unchanged the swap is one write of the parent, so
    /// readers see either the temp id or the real one.
    pub async fn replace_subtask_id(&self, temp_id: EntityId, subtask: Subtask) -> bool {
        let Some(parent) = self.parent_of(temp_id) else {
            self.upsert_subtask(subtask).await;
            return false;
        };
        if parent != subtask.task_id {
            self.delete_subtask(temp_id).await;
            self.upsert_subtask(subtask).await;
            return true;
        }
        let real_id = subtask.id;
        self.modify(parent, |task| {
            if real_id != temp_id {
                task.subtasks.retain(|s| s.id != real_id);
            }
            match task.subtasks.iter_mut().find(|s| s.id == temp_id) {
                Some(slot) => *slot = subtask,
                None => task.subtasks.push(subtask),
            }
        })
        .await
        .is_some()
    }

    /// Swaps the entry keyed `old_id` for a server copy of a task.
    ///
    /// `old_id` may equal `task.id` (a plain refresh). Subtasks that still
    /// carry temp ids are not known to the server yet; they are carried
    /// over and re-parented.
    pub async fn replace_task_id(&self, old_id: EntityId, task: Task) {
        self.replace_id(old_id, task, |old, new| {
            for subtask in old.subtasks.iter().filter(|s| s.id.is_temp()) {
                if new.subtasks.iter().all(|s| s.id != subtask.id) {
                    let mut carried = subtask.clone();
                    carried.task_id = new.id;
                    new.subtasks.push(carried);
                }
            }
        })
        .await;
    }
}
