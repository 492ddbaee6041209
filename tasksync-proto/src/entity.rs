//! Domain entities shared by the local caches and the remote executor.
//!
//! Every entity is keyed by an [`EntityId`]. Positive ids are assigned by the
//! server; negative ids are placeholders invented locally for objects whose
//! creation has not been acknowledged yet (see [`TempIdAllocator`]).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Maximum allowed title or name length in characters.
pub const MAX_TITLE_LENGTH: usize = 256;

/// Identifier of a task, subtask, list or label.
///
/// Server-assigned ids are strictly positive. Temporary ids are strictly
/// negative and never collide with a server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(i64);

impl EntityId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw integer value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns `true` for a locally-invented placeholder id.
    #[must_use]
    pub const fn is_temp(self) -> bool {
        self.0 < 0
    }

    /// Rewrites `self` to `to` if it currently equals `from`.
    ///
    /// Returns whether a replacement happened.
    pub fn remap(&mut self, from: Self, to: Self) -> bool {
        if *self == from {
            *self = to;
            true
        } else {
            false
        }
    }
}

impl From<i64> for EntityId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns the current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

/// Allocates temporary ids for optimistic creations.
///
/// Ids are derived from the wall clock (`-now_ms`) and are strictly
/// decreasing: if the clock has not advanced since the previous allocation
/// (or moved backwards), the next id is one below the previous one.
#[derive(Debug)]
pub struct TempIdAllocator {
    last: AtomicI64,
}

impl Default for TempIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TempIdAllocator {
    /// Creates an allocator with no history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    /// Creates an allocator that will never issue an id at or above `floor`.
    ///
    /// Used after a restart, seeded with the smallest temp id still queued.
    #[must_use]
    pub fn with_floor(floor: EntityId) -> Self {
        Self {
            last: AtomicI64::new(floor.get().min(0)),
        }
    }

    /// Returns the next temporary id. Always negative.
    pub fn next(&self) -> EntityId {
        self.next_at(now_ms())
    }

    /// Returns the next temporary id as if the clock read `now_ms`.
    pub fn next_at(&self, now_ms: u64) -> EntityId {
        let candidate = i64::try_from(now_ms).map_or(i64::MIN + 1, |ms| -ms.max(1));
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let id = if candidate < last {
                candidate
            } else {
                last.saturating_sub(1)
            };
            match self
                .last
                .compare_exchange_weak(last, id, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return EntityId(id),
                Err(actual) => last = actual,
            }
        }
    }
}

/// A checklist item belonging to a [`Task`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    /// Subtask id.
    pub id: EntityId,
    /// Owning task.
    pub task_id: EntityId,
    /// Subtask title.
    pub title: String,
    /// Whether the subtask is checked off.
    pub completed: bool,
}

/// A task, optionally filed under a list and tagged with labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task id.
    pub id: EntityId,
    /// List this task is filed under, if any.
    pub list_id: Option<EntityId>,
    /// Task title.
    pub title: String,
    /// Free-form notes.
    pub notes: Option<String>,
    /// Whether the task is done.
    pub completed: bool,
    /// Labels attached to this task.
    pub label_ids: Vec<EntityId>,
    /// Checklist items, in display order.
    pub subtasks: Vec<Subtask>,
    /// Server modification time (ms). `None` until acknowledged by the server.
    pub updated_at: Option<u64>,
}

/// A named collection of tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskList {
    /// List id.
    pub id: EntityId,
    /// Display name.
    pub name: String,
    /// Optional display color.
    pub color: Option<String>,
    /// Server modification time (ms).
    pub updated_at: Option<u64>,
}

/// A tag that can be attached to many tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Label id.
    pub id: EntityId,
    /// Display name.
    pub name: String,
    /// Optional display color.
    pub color: Option<String>,
    /// Server modification time (ms).
    pub updated_at: Option<u64>,
}

/// Which family of entity something refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A [`Task`].
    Task,
    /// A [`Subtask`].
    Subtask,
    /// A [`TaskList`].
    List,
    /// A [`Label`].
    Label,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Subtask => write!(f, "subtask"),
            Self::List => write!(f, "list"),
            Self::Label => write!(f, "label"),
        }
    }
}

/// An entity snapshot of any kind, as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entity {
    /// A task snapshot.
    Task(Task),
    /// A subtask snapshot.
    Subtask(Subtask),
    /// A list snapshot.
    List(TaskList),
    /// A label snapshot.
    Label(Label),
}

impl Entity {
    /// Returns the id of the wrapped entity.
    #[must_use]
    pub const fn id(&self) -> EntityId {
        match self {
            Self::Task(t) => t.id,
            Self::Subtask(s) => s.id,
            Self::List(l) => l.id,
            Self::Label(l) => l.id,
        }
    }

    /// Returns which kind of entity this is.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Task(_) => EntityKind::Task,
            Self::Subtask(_) => EntityKind::Subtask,
            Self::List(_) => EntityKind::List,
            Self::Label(_) => EntityKind::Label,
        }
    }

    /// Returns the server modification timestamp, if the kind carries one.
    #[must_use]
    pub const fn updated_at(&self) -> Option<u64> {
        match self {
            Self::Task(t) => t.updated_at,
            Self::Subtask(_) => None,
            Self::List(l) => l.updated_at,
            Self::Label(l) => l.updated_at,
        }
    }
}

/// Full server state, used for authoritative resyncs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Every task, subtasks included.
    pub tasks: Vec<Task>,
    /// Every list.
    pub lists: Vec<TaskList>,
    /// Every label.
    pub labels: Vec<Label>,
}
