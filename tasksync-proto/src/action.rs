//! Mutation kinds that can be queued while offline.
//!
//! [`Action`] is a closed sum type: each variant carries a typed payload and
//! declares exactly which of its fields are entity-id references (see
//! [`Action::id_refs_mut`]). Temp-id fixup rewrites those declared fields and
//! nothing else.

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, EntityKind, Label, Subtask, Task, TaskList};

/// Discriminant of an [`Action`], used for logging and conflict reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Create a task.
    CreateTask,
    /// Update a task.
    UpdateTask,
    /// Delete a task.
    DeleteTask,
    /// Create a subtask.
    CreateSubtask,
    /// Update a subtask.
    UpdateSubtask,
    /// Delete a subtask.
    DeleteSubtask,
    /// Create a list.
    CreateList,
    /// Update a list.
    UpdateList,
    /// Delete a list.
    DeleteList,
    /// Create a label.
    CreateLabel,
    /// Update a label.
    UpdateLabel,
    /// Delete a label.
    DeleteLabel,
}

impl ActionKind {
    /// Returns `true` for kinds that create a new entity (and get a temp id).
    #[must_use]
    pub const fn is_creation(self) -> bool {
        matches!(
            self,
            Self::CreateTask | Self::CreateSubtask | Self::CreateList | Self::CreateLabel
        )
    }

    /// Returns `true` for kinds that delete an entity.
    #[must_use]
    pub const fn is_deletion(self) -> bool {
        matches!(
            self,
            Self::DeleteTask | Self::DeleteSubtask | Self::DeleteList | Self::DeleteLabel
        )
    }

    /// Returns the kind of entity this action operates on.
    #[must_use]
    pub const fn entity_kind(self) -> EntityKind {
        match self {
            Self::CreateTask | Self::UpdateTask | Self::DeleteTask => EntityKind::Task,
            Self::CreateSubtask | Self::UpdateSubtask | Self::DeleteSubtask => EntityKind::Subtask,
            Self::CreateList | Self::UpdateList | Self::DeleteList => EntityKind::List,
            Self::CreateLabel | Self::UpdateLabel | Self::DeleteLabel => EntityKind::Label,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CreateTask => "create_task",
            Self::UpdateTask => "update_task",
            Self::DeleteTask => "delete_task",
            Self::CreateSubtask => "create_subtask",
            Self::UpdateSubtask => "update_subtask",
            Self::DeleteSubtask => "delete_subtask",
            Self::CreateList => "create_list",
            Self::UpdateList => "update_list",
            Self::DeleteList => "delete_list",
            Self::CreateLabel => "create_label",
            Self::UpdateLabel => "update_label",
            Self::DeleteLabel => "delete_label",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

/// Partial update of a [`Task`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    /// New title.
    pub title: Option<String>,
    /// New notes (`Some(None)` clears them).
    pub notes: Option<Option<String>>,
    /// New completion flag.
    pub completed: Option<bool>,
    /// Move to a list (`Some(None)` removes from its list).
    pub list_id: Option<Option<EntityId>>,
    /// Replace the label set.
    pub label_ids: Option<Vec<EntityId>>,
}

impl TaskPatch {
    /// Applies this patch to a task.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title.clone_from(title);
        }
        if let Some(notes) = &self.notes {
            task.notes.clone_from(notes);
        }
        if let Some(completed) = self.completed {
            task.completed = completed;
        }
        if let Some(list_id) = self.list_id {
            task.list_id = list_id;
        }
        if let Some(label_ids) = &self.label_ids {
            task.label_ids.clone_from(label_ids);
        }
    }

    /// Shallow merge: every field set in `other` overrides ours.
    pub fn merge(&mut self, other: Self) {
        if other.title.is_some() {
            self.title = other.title;
        }
        if other.notes.is_some() {
            self.notes = other.notes;
        }
        if other.completed.is_some() {
            self.completed = other.completed;
        }
        if other.list_id.is_some() {
            self.list_id = other.list_id;
        }
        if other.label_ids.is_some() {
            self.label_ids = other.label_ids;
        }
    }

    fn id_refs_mut(&mut self) -> Vec<&mut EntityId> {
        let mut refs = Vec::new();
        if let Some(Some(list_id)) = &mut self.list_id {
            refs.push(list_id);
        }
        if let Some(label_ids) = &mut self.label_ids {
            refs.extend(label_ids.iter_mut());
        }
        refs
    }
}

/// Partial update of a [`Subtask`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskPatch {
    /// New title.
    pub title: Option<String>,
    /// New completion flag.
    pub completed: Option<bool>,
}

impl SubtaskPatch {
    /// Applies this patch to a subtask.
    pub fn apply_to(&self, subtask: &mut Subtask) {
        if let Some(title) = &self.title {
            subtask.title.clone_from(title);
        }
        if let Some(completed) = self.completed {
            subtask.completed = completed;
        }
    }

    /// Shallow merge: every field set in `other` overrides ours.
    pub fn merge(&mut self, other: Self) {
        if other.title.is_some() {
            self.title = other.title;
        }
        if other.completed.is_some() {
            self.completed = other.completed;
        }
    }
}

/// Partial update of a [`TaskList`] or [`Label`]; both carry a name and color.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPatch {
    /// New display name.
    pub name: Option<String>,
    /// New color (`Some(None)` clears it).
    pub color: Option<Option<String>>,
}

impl NamedPatch {
    /// Applies this patch to a list.
    pub fn apply_to_list(&self, list: &mut TaskList) {
        if let Some(name) = &self.name {
            list.name.clone_from(name);
        }
        if let Some(color) = &self.color {
            list.color.clone_from(color);
        }
    }

    /// Applies this patch to a label.
    pub fn apply_to_label(&self, label: &mut Label) {
        if let Some(name) = &self.name {
            label.name.clone_from(name);
        }
        if let Some(color) = &self.color {
            label.color.clone_from(color);
        }
    }

    /// Shallow merge: every field set in `other` overrides ours.
    pub fn merge(&mut self, other: Self) {
        if other.name.is_some() {
            self.name = other.name;
        }
        if other.color.is_some() {
            self.color = other.color;
        }
    }
}

/// A patch of any kind, used when resolving a conflict by merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Patch {
    /// Task fields.
    Task(TaskPatch),
    /// Subtask fields.
    Subtask(SubtaskPatch),
    /// List or label fields.
    Named(NamedPatch),
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Fields for a new task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDraft {
    /// Title (required, non-empty).
    pub title: String,
    /// Optional notes.
    pub notes: Option<String>,
    /// List to file the task under.
    pub list_id: Option<EntityId>,
    /// Labels to attach.
    pub label_ids: Vec<EntityId>,
}

impl TaskDraft {
    /// Creates a draft with just a title.
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Materialises the draft as a task with the given id.
    #[must_use]
    pub fn to_task(&self, id: EntityId) -> Task {
        Task {
            id,
            list_id: self.list_id,
            title: self.title.clone(),
            notes: self.notes.clone(),
            completed: false,
            label_ids: self.label_ids.clone(),
            subtasks: Vec::new(),
            updated_at: None,
        }
    }
}

/// Fields for a new list or label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedDraft {
    /// Display name (required, non-empty).
    pub name: String,
    /// Optional color.
    pub color: Option<String>,
}

impl NamedDraft {
    /// Creates a draft with just a name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: None,
        }
    }
}

/// Update payload shared by tasks, lists and labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update<P> {
    /// Entity being updated.
    pub id: EntityId,
    /// Fields to change.
    pub patch: P,
    /// Last server modification time the client saw for this entity.
    ///
    /// The server rejects the update with a conflict if its current
    /// timestamp differs. `None` means "overwrite unconditionally".
    pub expected_updated_at: Option<u64>,
}

impl<P> Update<P> {
    /// Creates an unguarded update; the guard is attached at dispatch.
    pub const fn new(id: EntityId, patch: P) -> Self {
        Self {
            id,
            patch,
            expected_updated_at: None,
        }
    }
}

/// Payload of [`Action::CreateSubtask`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskDraft {
    /// Owning task.
    pub task_id: EntityId,
    /// Subtask title.
    pub title: String,
}

/// Payload of [`Action::UpdateSubtask`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskUpdate {
    /// Subtask being updated.
    pub id: EntityId,
    /// Fields to change.
    pub patch: SubtaskPatch,
}

/// A queued mutation with its typed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Create a task.
    CreateTask(TaskDraft),
    /// Update a task.
    UpdateTask(Update<TaskPatch>),
    /// Delete a task.
    DeleteTask(EntityId),
    /// Create a subtask under a task.
    CreateSubtask(SubtaskDraft),
    /// Update a subtask.
    UpdateSubtask(SubtaskUpdate),
    /// Delete a subtask.
    DeleteSubtask(EntityId),
    /// Create a list.
    CreateList(NamedDraft),
    /// Update a list.
    UpdateList(Update<NamedPatch>),
    /// Delete a list.
    DeleteList(EntityId),
    /// Create a label.
    CreateLabel(NamedDraft),
    /// Update a label.
    UpdateLabel(Update<NamedPatch>),
    /// Delete a label.
    DeleteLabel(EntityId),
}

/// Returned by [`Action::merge_patch`] when the patch kind does not fit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot merge a {patch} patch into a {action} action")]
pub struct PatchMismatch {
    /// The action kind that was targeted.
    pub action: ActionKind,
    /// Which patch family was supplied.
    pub patch: &'static str,
}

impl Action {
    /// Returns the discriminant of this action.
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::CreateTask(_) => ActionKind::CreateTask,
            Self::UpdateTask(_) => ActionKind::UpdateTask,
            Self::DeleteTask(_) => ActionKind::DeleteTask,
            Self::CreateSubtask(_) => ActionKind::CreateSubtask,
            Self::UpdateSubtask(_) => ActionKind::UpdateSubtask,
            Self::DeleteSubtask(_) => ActionKind::DeleteSubtask,
            Self::CreateList(_) => ActionKind::CreateList,
            Self::UpdateList(_) => ActionKind::UpdateList,
            Self::DeleteList(_) => ActionKind::DeleteList,
            Self::CreateLabel(_) => ActionKind::CreateLabel,
            Self::UpdateLabel(_) => ActionKind::UpdateLabel,
            Self::DeleteLabel(_) => ActionKind::DeleteLabel,
        }
    }

    /// Returns the existing entity this action targets, if any.
    ///
    /// Creations have no target; a subtask creation reports nothing here
    /// even though it references its parent task.
    #[must_use]
    pub const fn target(&self) -> Option<EntityId> {
        match self {
            Self::UpdateTask(u) => Some(u.id),
            Self::UpdateList(u) | Self::UpdateLabel(u) => Some(u.id),
            Self::UpdateSubtask(u) => Some(u.id),
            Self::DeleteTask(id)
            | Self::DeleteSubtask(id)
            | Self::DeleteList(id)
            | Self::DeleteLabel(id) => Some(*id),
            Self::CreateTask(_)
            | Self::CreateSubtask(_)
            | Self::CreateList(_)
            | Self::CreateLabel(_) => None,
        }
    }

    /// Returns every declared entity-id reference in this payload.
    pub fn id_refs_mut(&mut self) -> Vec<&mut EntityId> {
        match self {
            Self::CreateTask(draft) => {
                let mut refs: Vec<&mut EntityId> = draft.list_id.iter_mut().collect();
                refs.extend(draft.label_ids.iter_mut());
                refs
            }
            Self::UpdateTask(update) => {
                let mut refs = vec![&mut update.id];
                refs.extend(update.patch.id_refs_mut());
                refs
            }
            Self::CreateSubtask(draft) => vec![&mut draft.task_id],
            Self::UpdateSubtask(update) => vec![&mut update.id],
            Self::UpdateList(update) | Self::UpdateLabel(update) => vec![&mut update.id],
            Self::DeleteTask(id)
            | Self::DeleteSubtask(id)
            | Self::DeleteList(id)
            | Self::DeleteLabel(id) => vec![id],
            Self::CreateList(_) | Self::CreateLabel(_) => Vec::new(),
        }
    }

    /// Returns every declared entity-id reference, by value.
    #[must_use]
    pub fn id_refs(&self) -> Vec<EntityId> {
        let mut copy = self.clone();
        copy.id_refs_mut().into_iter().map(|id| *id).collect()
    }

    /// Replaces every declared reference to `from` with `to`.
    ///
    /// Returns the number of references rewritten.
    pub fn remap_id(&mut self, from: EntityId, to: EntityId) -> usize {
        self.id_refs_mut()
            .into_iter()
            .filter_map(|id| id.remap(from, to).then_some(()))
            .count()
    }

    /// Returns `true` if any declared reference is still a temp id.
    #[must_use]
    pub fn references_temp_ids(&self) -> bool {
        self.id_refs().iter().any(|id| id.is_temp())
    }

    /// Returns the optimistic-concurrency guard, if this kind carries one.
    #[must_use]
    pub const fn expected_updated_at(&self) -> Option<u64> {
        match self {
            Self::UpdateTask(u) => u.expected_updated_at,
            Self::UpdateList(u) | Self::UpdateLabel(u) => u.expected_updated_at,
            _ => None,
        }
    }

    /// Sets the guard if this kind carries one and it is not already set.
    ///
    /// Returns `true` if the guard was attached.
    pub fn attach_guard(&mut self, updated_at: u64) -> bool {
        let slot = match self {
            Self::UpdateTask(u) => &mut u.expected_updated_at,
            Self::UpdateList(u) | Self::UpdateLabel(u) => &mut u.expected_updated_at,
            _ => return false,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(updated_at);
        true
    }

    /// Removes the guard so the server overwrites unconditionally.
    pub fn strip_guard(&mut self) {
        match self {
            Self::UpdateTask(u) => u.expected_updated_at = None,
            Self::UpdateList(u) | Self::UpdateLabel(u) => u.expected_updated_at = None,
            _ => {}
        }
    }

    /// Shallow-merges `patch` into this action's patch.
    ///
    /// # Errors
    ///
    /// Returns [`PatchMismatch`] if the action is not an update of the
    /// matching family.
    pub fn merge_patch(&mut self, patch: Patch) -> Result<(), PatchMismatch> {
        let kind = self.kind();
        match (self, patch) {
            (Self::UpdateTask(u), Patch::Task(p)) => u.patch.merge(p),
            (Self::UpdateSubtask(u), Patch::Subtask(p)) => u.patch.merge(p),
            (Self::UpdateList(u) | Self::UpdateLabel(u), Patch::Named(p)) => u.patch.merge(p),
            (_, patch) => {
                return Err(PatchMismatch {
                    action: kind,
                    patch: match patch {
                        Patch::Task(_) => "task",
                        Patch::Subtask(_) => "subtask",
                        Patch::Named(_) => "list/label",
                    },
                });
            }
        }
        Ok(())
    }

    /// Returns the user-supplied title or name, for validation.
    #[must_use]
    pub fn title(&self) -> Option<&str> {
        match self {
            Self::CreateTask(d) => Some(&d.title),
            Self::CreateSubtask(d) => Some(&d.title),
            Self::CreateList(d) | Self::CreateLabel(d) => Some(&d.name),
            Self::UpdateTask(u) => u.patch.title.as_deref(),
            Self::UpdateSubtask(u) => u.patch.title.as_deref(),
            Self::UpdateList(u) | Self::UpdateLabel(u) => u.patch.name.as_deref(),
            Self::DeleteTask(_)
            | Self::DeleteSubtask(_)
            | Self::DeleteList(_)
            | Self::DeleteLabel(_) => None,
        }
    }
}
