//! Durable queue records and conflict descriptions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::{Action, ActionKind};
use crate::entity::{Entity, EntityId, now_ms};

/// Failure reason recorded on an action whose guard was rejected.
pub const CONFLICT_REASON: &str = "CONFLICT";

/// Unique identifier for a queued action, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(Uuid);

impl ActionId {
    /// Creates a new time-ordered action identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates an `ActionId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for ActionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replay state of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    /// Waiting to be replayed.
    Pending,
    /// Currently being sent to the server.
    Processing,
    /// Last replay attempt failed; see `failure_reason`.
    Failed,
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A mutation captured locally and awaiting acknowledgment by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Queue record id.
    pub id: ActionId,
    /// The mutation and its arguments.
    pub action: Action,
    /// When the action was dispatched (ms since epoch).
    pub timestamp: u64,
    /// Replay state.
    pub status: ActionStatus,
    /// Why the last attempt failed.
    pub failure_reason: Option<String>,
    /// Number of unclassified failures so far.
    pub retry_count: u32,
    /// Placeholder id of the entity this creation produces.
    pub temp_id: Option<EntityId>,
}

impl PendingAction {
    /// Builds a fresh pending record.
    ///
    /// `temp_id` is only kept for creation kinds and only if negative.
    #[must_use]
    pub fn new(action: Action, temp_id: Option<EntityId>) -> Self {
        let temp_id = temp_id.filter(|id| id.is_temp() && action.kind().is_creation());
        Self {
            id: ActionId::new(),
            action,
            timestamp: now_ms(),
            status: ActionStatus::Pending,
            failure_reason: None,
            retry_count: 0,
            temp_id,
        }
    }

    /// Returns the kind of the wrapped action.
    #[must_use]
    pub const fn kind(&self) -> ActionKind {
        self.action.kind()
    }

    /// Returns `true` if the last attempt was rejected by the guard.
    #[must_use]
    pub fn is_conflicted(&self) -> bool {
        self.status == ActionStatus::Failed
            && self.failure_reason.as_deref() == Some(CONFLICT_REASON)
    }
}

/// A detected mismatch between the client's assumed state and the server's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// The queued action that was rejected.
    pub action_id: ActionId,
    /// Its kind.
    pub action_kind: ActionKind,
    /// The server's current entity; `None` if it no longer exists.
    pub server_data: Option<Entity>,
    /// The local mutation that conflicted.
    pub local_data: Action,
    /// When the conflict was detected (ms since epoch).
    pub timestamp: u64,
}

impl ConflictInfo {
    /// Describes a conflict for `pending` against `server_data`.
    #[must_use]
    pub fn new(pending: &PendingAction, server_data: Option<Entity>) -> Self {
        Self {
            action_id: pending.id.clone(),
            action_kind: pending.kind(),
            server_data,
            local_data: pending.action.clone(),
            timestamp: now_ms(),
        }
    }
}
