//! Remote action executor abstraction.
//!
//! Defines the [`RemoteExecutor`] trait the sync engine replays queued
//! actions against. Concrete implementations:
//! - [`memory::MemoryRemote`]: in-process server model for testing
//! - [`Unreachable`]: an executor that is never online, used by the CLI

pub mod memory;

pub use memory::MemoryRemote;

use tasksync_proto::action::{Action, ActionKind};
use tasksync_proto::entity::{Entity, Snapshot};

/// Errors a remote executor can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The optimistic-concurrency guard did not match.
    ///
    /// Carries the server's current copy of the entity, or `None` if the
    /// entity no longer exists.
    #[error("conflict: server copy has changed")]
    Conflict {
        /// The server's current snapshot.
        server: Option<Entity>,
    },

    /// This executor has no handler for the action kind.
    #[error("unsupported action kind: {0}")]
    Unsupported(ActionKind),

    /// The server refused the mutation (validation, missing entity, ...).
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// The server could not be reached.
    #[error("server unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    /// Returns `true` for a guard mismatch.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Performs queued mutations against the backend.
///
/// # Contract
///
/// - A creation returns the stored entity with its server-assigned
///   (positive) id.
/// - An update returns the entity after the change. If the action carries
///   an `expected_updated_at` guard that differs from the entity's current
///   modification time, the executor MUST fail with
///   [`RemoteError::Conflict`] instead of overwriting.
/// - A deletion returns `None`.
pub trait RemoteExecutor: Send + Sync + 'static {
    /// Execute one action.
    fn execute(
        &self,
        action: &Action,
    ) -> impl std::future::Future<Output = Result<Option<Entity>, RemoteError>> + Send;

    /// Fetch the full authoritative data set.
    fn fetch_snapshot(
        &self,
    ) -> impl std::future::Future<Output = Result<Snapshot, RemoteError>> + Send;
}

/// Executor for a client with no configured backend.
///
/// Every call fails with [`RemoteError::Unavailable`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Unreachable;

impl RemoteExecutor for Unreachable {
    async fn execute(&self, action: &Action) -> Result<Option<Entity>, RemoteError> {
        Err(RemoteError::Unavailable(format!(
            "no backend configured for {}",
            action.kind()
        )))
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot, RemoteError> {
        Err(RemoteError::Unavailable("no backend configured".to_string()))
    }
}
