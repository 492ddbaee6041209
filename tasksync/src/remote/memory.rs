//! In-process server model for testing.
//!
//! [`MemoryRemote`] behaves like the backend the sync engine talks to: it
//! assigns positive ids, stamps every change with a monotonic `updated_at`,
//! enforces the optimistic-concurrency guard, and refuses payloads that
//! still hold temporary ids. Tests drive it through an online switch, fault
//! injection and a log of every call it received.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use tasksync_proto::action::{Action, NamedDraft, NamedPatch, Update};
use tasksync_proto::entity::{Entity, EntityId, Label, Snapshot, Subtask, Task, TaskList};

use super::{RemoteError, RemoteExecutor};

/// First value of the logical modification clock.
const CLOCK_START: u64 = 1_000;

#[derive(Debug)]
struct ServerState {
    next_id: i64,
    clock: u64,
    tasks: BTreeMap<EntityId, Task>,
    lists: BTreeMap<EntityId, TaskList>,
    labels: BTreeMap<EntityId, Label>,
    online: bool,
    latency: Duration,
    faults: VecDeque<RemoteError>,
    calls: Vec<Action>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            next_id: 1,
            clock: CLOCK_START,
            tasks: BTreeMap::new(),
            lists: BTreeMap::new(),
            labels: BTreeMap::new(),
            online: true,
            latency: Duration::ZERO,
            faults: VecDeque::new(),
            calls: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<ServerState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Shared in-process backend. Clones talk to the same server.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

fn not_found(what: &str, id: EntityId) -> RemoteError {
    RemoteError::Rejected(format!("{what} {id} not found"))
}

fn check_title(title: &str) -> Result<(), RemoteError> {
    if title.trim().is_empty() {
        return Err(RemoteError::Rejected("title must not be empty".to_string()));
    }
    Ok(())
}

/// Compares the guard against the stored modification time.
fn check_guard<T: Clone>(
    expected: Option<u64>,
    current: Option<&T>,
    updated_at: impl Fn(&T) -> Option<u64>,
    wrap: impl Fn(T) -> Entity,
) -> Result<(), RemoteError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match current {
        None => Err(RemoteError::Conflict { server: None }),
        Some(entity) if updated_at(entity) != Some(expected) => Err(RemoteError::Conflict {
            server: Some(wrap(entity.clone())),
        }),
        Some(_) => Ok(()),
    }
}

impl ServerState {
    fn alloc_id(&mut self) -> EntityId {
        let id = EntityId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn parent_of(&self, subtask_id: EntityId) -> Option<EntityId> {
        self.tasks
            .values()
            .find(|t| t.subtasks.iter().any(|s| s.id == subtask_id))
            .map(|t| t.id)
    }

    fn check_refs(&self, list_id: Option<EntityId>, label_ids: &[EntityId]) -> Result<(), RemoteError> {
        if let Some(list_id) = list_id
            && !self.lists.contains_key(&list_id)
        {
            return Err(not_found("list", list_id));
        }
        if let Some(missing) = label_ids.iter().find(|id| !self.labels.contains_key(id)) {
            return Err(not_found("label", *missing));
        }
        Ok(())
    }

    fn apply(&mut self, action: &Action) -> Result<Option<Entity>, RemoteError> {
        if let Some(temp) = action.id_refs().into_iter().find(|id| id.is_temp()) {
            return Err(RemoteError::Rejected(format!("unresolved temporary id {temp}")));
        }
        if let Some(title) = action.title() {
            check_title(title)?;
        }

        match action {
            Action::CreateTask(draft) => {
                self.check_refs(draft.list_id, &draft.label_ids)?;
                let mut task = draft.to_task(self.alloc_id());
                task.updated_at = Some(self.tick());
                self.tasks.insert(task.id, task.clone());
                Ok(Some(Entity::Task(task)))
            }
            Action::UpdateTask(update) => {
                check_guard(
                    update.expected_updated_at,
                    self.tasks.get(&update.id),
                    |t| t.updated_at,
                    Entity::Task,
                )?;
                if let Some(list_id) = update.patch.list_id {
                    self.check_refs(list_id, &[])?;
                }
                if let Some(label_ids) = &update.patch.label_ids {
                    self.check_refs(None, label_ids)?;
                }
                let now = self.tick();
                let task = self
                    .tasks
                    .get_mut(&update.id)
                    .ok_or_else(|| not_found("task", update.id))?;
                update.patch.apply_to(task);
                task.updated_at = Some(now);
                Ok(Some(Entity::Task(task.clone())))
            }
            Action::DeleteTask(id) => {
                self.tasks.remove(id);
                Ok(None)
            }
            Action::CreateSubtask(draft) => {
                let id = self.alloc_id();
                let now = self.tick();
                let task = self
                    .tasks
                    .get_mut(&draft.task_id)
                    .ok_or_else(|| not_found("task", draft.task_id))?;
                let subtask = Subtask {
                    id,
                    task_id: task.id,
                    title: draft.title.clone(),
                    completed: false,
                };
                task.subtasks.push(subtask.clone());
                task.updated_at = Some(now);
                Ok(Some(Entity::Subtask(subtask)))
            }
            Action::UpdateSubtask(update) => {
                let parent = self
                    .parent_of(update.id)
                    .ok_or_else(|| not_found("subtask", update.id))?;
                let now = self.tick();
                let task = self
                    .tasks
                    .get_mut(&parent)
                    .ok_or_else(|| not_found("task", parent))?;
                task.updated_at = Some(now);
                let subtask = task
                    .subtasks
                    .iter_mut()
                    .find(|s| s.id == update.id)
                    .ok_or_else(|| not_found("subtask", update.id))?;
                update.patch.apply_to(subtask);
                Ok(Some(Entity::Subtask(subtask.clone())))
            }
            Action::DeleteSubtask(id) => {
                if let Some(parent) = self.parent_of(*id) {
                    let now = self.tick();
                    if let Some(task) = self.tasks.get_mut(&parent) {
                        task.subtasks.retain(|s| s.id != *id);
                        task.updated_at = Some(now);
                    }
                }
                Ok(None)
            }
            Action::CreateList(draft) => {
                let list = self.create_named(draft, |id, name, color, updated_at| TaskList {
                    id,
                    name,
                    color,
                    updated_at,
                });
                self.lists.insert(list.id, list.clone());
                Ok(Some(Entity::List(list)))
            }
            Action::UpdateList(update) => {
                let list = self.update_named(update, Kind::List)?;
                Ok(Some(list))
            }
            Action::DeleteList(id) => {
                if self.lists.remove(id).is_some() {
                    let now = self.tick();
                    for task in self.tasks.values_mut().filter(|t| t.list_id == Some(*id)) {
                        task.list_id = None;
                        task.updated_at = Some(now);
                    }
                }
                Ok(None)
            }
            Action::CreateLabel(draft) => {
                let label = self.create_named(draft, |id, name, color, updated_at| Label {
                    id,
                    name,
                    color,
                    updated_at,
                });
                self.labels.insert(label.id, label.clone());
                Ok(Some(Entity::Label(label)))
            }
            Action::UpdateLabel(update) => {
                let label = self.update_named(update, Kind::Label)?;
                Ok(Some(label))
            }
            Action::DeleteLabel(id) => {
                if self.labels.remove(id).is_some() {
                    let now = self.tick();
                    for task in self.tasks.values_mut().filter(|t| t.label_ids.contains(id)) {
                        task.label_ids.retain(|l| l != id);
                        task.updated_at = Some(now);
                    }
                }
                Ok(None)
            }
        }
    }

    fn create_named<T>(
        &mut self,
        draft: &NamedDraft,
        build: impl FnOnce(EntityId, String, Option<String>, Option<u64>) -> T,
    ) -> T {
        let id = self.alloc_id();
        let now = self.tick();
        build(id, draft.name.clone(), draft.color.clone(), Some(now))
    }

    fn update_named(&mut self, update: &Update<NamedPatch>, kind: Kind) -> Result<Entity, RemoteError> {
        match kind {
            Kind::List => {
                check_guard(
                    update.expected_updated_at,
                    self.lists.get(&update.id),
                    |l| l.updated_at,
                    Entity::List,
                )?;
                let now = self.tick();
                let list = self
                    .lists
                    .get_mut(&update.id)
                    .ok_or_else(|| not_found("list", update.id))?;
                update.patch.apply_to_list(list);
                list.updated_at = Some(now);
                Ok(Entity::List(list.clone()))
            }
            Kind::Label => {
                check_guard(
                    update.expected_updated_at,
                    self.labels.get(&update.id),
                    |l| l.updated_at,
                    Entity::Label,
                )?;
                let now = self.tick();
                let label = self
                    .labels
                    .get_mut(&update.id)
                    .ok_or_else(|| not_found("label", update.id))?;
                update.patch.apply_to_label(label);
                label.updated_at = Some(now);
                Ok(Entity::Label(label.clone()))
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Kind {
    List,
    Label,
}

impl MemoryRemote {
    /// Create an empty, online server.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the server on or off the network.
    pub fn set_online(&self, online: bool) {
        self.inner.state.lock().online = online;
    }

    /// Delay every call by `latency` before it is applied.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.state.lock().latency = latency;
    }

    /// Make the next call fail with `error` (faults queue up in order).
    pub fn fail_next(&self, error: RemoteError) {
        self.inner.state.lock().faults.push_back(error);
    }

    /// Returns every action received so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<Action> {
        self.inner.state.lock().calls.clone()
    }

    /// Returns the highest number of calls that were ever in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Stores a task as if another client had created it.
    ///
    /// A non-positive id is replaced by a fresh server id.
    pub fn seed_task(&self, mut task: Task) -> Task {
        let mut state = self.inner.state.lock();
        if task.id.get() <= 0 {
            task.id = state.alloc_id();
        } else {
            state.next_id = state.next_id.max(task.id.get() + 1);
        }
        for subtask in &mut task.subtasks {
            if subtask.id.get() <= 0 {
                subtask.id = state.alloc_id();
            }
            subtask.task_id = task.id;
        }
        task.updated_at = Some(state.tick());
        state.tasks.insert(task.id, task.clone());
        task
    }

    /// Stores a list as if another client had created it.
    pub fn seed_list(&self, name: &str) -> TaskList {
        let mut state = self.inner.state.lock();
        let list = state.create_named(&NamedDraft::named(name), |id, name, color, updated_at| {
            TaskList {
                id,
                name,
                color,
                updated_at,
            }
        });
        state.lists.insert(list.id, list.clone());
        list
    }

    /// Applies `f` to a stored task as a concurrent edit from another
    /// client, bumping its modification time.
    pub fn edit_task(&self, id: EntityId, f: impl FnOnce(&mut Task)) -> Option<Task> {
        let mut state = self.inner.state.lock();
        let now = state.tick();
        let task = state.tasks.get_mut(&id)?;
        f(task);
        task.updated_at = Some(now);
        Some(task.clone())
    }

    /// Removes a task as a concurrent delete from another client.
    pub fn remove_task(&self, id: EntityId) -> Option<Task> {
        self.inner.state.lock().tasks.remove(&id)
    }

    /// Returns the stored copy of a task.
    #[must_use]
    pub fn task(&self, id: EntityId) -> Option<Task> {
        self.inner.state.lock().tasks.get(&id).cloned()
    }

    /// Returns the stored copy of a list.
    #[must_use]
    pub fn list(&self, id: EntityId) -> Option<TaskList> {
        self.inner.state.lock().lists.get(&id).cloned()
    }

    /// Returns the stored copy of a label.
    #[must_use]
    pub fn label(&self, id: EntityId) -> Option<Label> {
        self.inner.state.lock().labels.get(&id).cloned()
    }

    /// Returns every stored task.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.inner.state.lock().tasks.values().cloned().collect()
    }
}

impl RemoteExecutor for MemoryRemote {
    async fn execute(&self, action: &Action) -> Result<Option<Entity>, RemoteError> {
        let latency = {
            let mut state = self.inner.state.lock();
            state.calls.push(action.clone());
            if !state.online {
                return Err(RemoteError::Unavailable("server offline".to_string()));
            }
            if let Some(fault) = state.faults.pop_front() {
                return Err(fault);
            }
            state.latency
        };

        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let result = self.inner.state.lock().apply(action);
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);

        match &result {
            Ok(entity) => tracing::debug!(
                kind = %action.kind(),
                id = ?entity.as_ref().map(Entity::id),
                "remote applied action"
            ),
            Err(err) => tracing::debug!(kind = %action.kind(), error = %err, "remote refused action"),
        }
        result
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot, RemoteError> {
        let state = self.inner.state.lock();
        if !state.online {
            return Err(RemoteError::Unavailable("server offline".to_string()));
        }
        Ok(Snapshot {
            tasks: state.tasks.values().cloned().collect(),
            lists: state.lists.values().cloned().collect(),
            labels: state.labels.values().cloned().collect(),
        })
    }
}
