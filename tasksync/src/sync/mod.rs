//! Sync orchestrator for offline-first task data.
//!
//! Contains the [`SyncEngine`], which owns the dispatch of new mutations,
//! sequential replay of the durable queue against a [`RemoteExecutor`],
//! temporary-id fixup, and conflict bookkeeping.
//!
//! # Dispatch pipeline
//!
//! 1. Validate the action (titles and names)
//! 2. Translate temp ids that were already fixed up this session
//! 3. Allocate a temp id for creations; attach the concurrency guard to updates
//! 4. Durably enqueue the [`PendingAction`]
//! 5. Apply the optimistic mutation to the caches
//! 6. If online, start a replay in the background
//!
//! Steps 2 to 5 hold the same lock as the queue rewrites that follow an
//! acknowledgment, so a dispatched action either sees a fixup in full or
//! is queued in time to be rewritten by it.
//!
//! # Replay
//!
//! Only one replay runs at a time. A trigger that arrives while a replay
//! is running does not start a second one; it asks the running worker to
//! take one more pass once its current pass ends. Actions are replayed
//! strictly in queue order:
//! - success removes the action (after temp-id fixup or cache reconcile)
//! - a conflict records a [`ConflictInfo`], marks the action failed and
//!   moves on
//! - any other failure marks the action failed and ends the pass

pub mod conflicts;
pub mod connectivity;
pub mod context;
pub mod freshness;

pub use conflicts::ConflictSurface;
pub use connectivity::{Connectivity, Signal};
pub use context::SyncContext;
pub use freshness::{Freshness, MaxAge};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};

use tasksync_proto::action::{Action, Patch, PatchMismatch};
use tasksync_proto::entity::{Entity, EntityId, MAX_TITLE_LENGTH, TempIdAllocator, now_ms};
use tasksync_proto::pending::{
    ActionId, ActionStatus, CONFLICT_REASON, ConflictInfo, PendingAction,
};

use crate::remote::{RemoteError, RemoteExecutor};
use crate::store::{Storage, StoreError};

/// Errors returned by [`SyncEngine`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The durable queue or cache storage failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// The action was rejected before it was queued.
    #[error("invalid action: {0}")]
    Validation(#[from] ValidationError),

    /// No unresolved conflict exists for the action.
    #[error("no unresolved conflict for action {0}")]
    ConflictNotFound(ActionId),

    /// The action is not (or no longer) queued.
    #[error("action {0} is not queued")]
    ActionNotFound(ActionId),

    /// A merge patch does not fit the conflicted action.
    #[error(transparent)]
    PatchMismatch(#[from] PatchMismatch),
}

/// Reasons an action is refused at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The title or name is empty (or only whitespace).
    #[error("title must not be empty")]
    EmptyTitle,

    /// The title or name is too long.
    #[error("title is {len} characters (max {max})")]
    TitleTooLong {
        /// Actual length in characters.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
}

/// Tuning knobs for a [`SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum title or name length in characters.
    pub max_title_len: usize,
    /// Capacity of the conflict surface.
    pub max_conflicts: usize,
    /// Capacity of the [`SyncEvent`] channel.
    pub event_buffer: usize,
    /// Age after which [`SyncEngine::initial_load`] refetches everything.
    pub stale_after: Duration,
    /// Connectivity at startup.
    pub online: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_title_len: MAX_TITLE_LENGTH,
            max_conflicts: conflicts::DEFAULT_MAX_CONFLICTS,
            event_buffer: 256,
            stale_after: Duration::from_secs(5 * 60),
            online: true,
        }
    }
}

/// How the user chose to settle a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Drop the local change and take the server copy.
    Server,
    /// Overwrite the server with the local change.
    Local,
    /// Overwrite the server with the local change plus these fields.
    Merge(Patch),
}

/// Why a replay did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The client is offline.
    Offline,
    /// Another replay is in progress.
    AlreadyRunning,
}

/// Outcome of one [`SyncEngine::process_queue`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Set if the replay did not run at all.
    pub skipped: Option<SkipReason>,
    /// Actions acknowledged and removed.
    pub succeeded: usize,
    /// Actions that newly conflicted.
    pub conflicted: usize,
    /// Actions dropped because the executor does not support them.
    pub dropped: usize,
    /// Conflicted actions passed over because they await a decision.
    pub awaiting_resolution: usize,
    /// The action whose failure ended the replay, if any.
    pub halted_at: Option<ActionId>,
}

impl ReplayReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    /// Returns `true` if the replay ran (even over an empty queue).
    #[must_use]
    pub const fn ran(&self) -> bool {
        self.skipped.is_none()
    }
}

/// What [`SyncEngine::dispatch`] hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// The queued action.
    pub action_id: ActionId,
    /// Placeholder id of a created entity.
    pub temp_id: Option<EntityId>,
    /// The optimistic entity, if the action produced or touched one.
    pub entity: Option<Entity>,
}

/// Outcome of [`SyncEngine::initial_load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Entries loaded into the caches from storage.
    pub loaded: usize,
    /// The replay that ran, if any.
    pub replay: Option<ReplayReport>,
    /// Whether the caches were replaced with a fresh server snapshot.
    pub refreshed: bool,
}

/// Snapshot of engine state for status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    /// Drives the offline banner.
    pub online: bool,
    /// Drives the syncing indicator.
    pub syncing: bool,
    /// Actions still queued.
    pub pending: usize,
    /// Drives the conflict badge.
    pub conflicts: usize,
}

/// Events emitted by the [`SyncEngine`] for UI notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The online state changed.
    ConnectivityChanged {
        /// The new state.
        online: bool,
    },
    /// A replay started.
    ReplayStarted {
        /// Actions queued at the start.
        pending: usize,
    },
    /// A replay finished.
    ReplayFinished(ReplayReport),
    /// An unclassified failure ended a replay.
    ReplayHalted {
        /// The failing action.
        action_id: ActionId,
        /// How many times it has failed so far.
        retry_count: u32,
        /// The error detail.
        reason: String,
    },
    /// The number of unresolved conflicts changed.
    ConflictsChanged {
        /// The new count.
        count: usize,
    },
    /// A created entity received its server id.
    IdAssigned {
        /// The placeholder id.
        temp_id: EntityId,
        /// The server-assigned id.
        real_id: EntityId,
    },
}

/// Clears the syncing flag on every exit path.
struct SyncingGuard<'a>(&'a AtomicBool);

impl<'a> SyncingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Offline-first sync orchestrator.
///
/// All mutation of the queue and caches goes through [`dispatch`],
/// [`process_queue`], [`resolve_conflict`] and [`discard`].
///
/// [`dispatch`]: Self::dispatch
/// [`process_queue`]: Self::process_queue
/// [`resolve_conflict`]: Self::resolve_conflict
/// [`discard`]: Self::discard
pub struct SyncEngine<S: Storage, R: RemoteExecutor> {
    ctx: SyncContext<S>,
    remote: R,
    conflicts: ConflictSurface,
    connectivity: Connectivity,
    temp_ids: TempIdAllocator,
    /// Temp → real ids learned this session.
    id_map: RwLock<HashMap<EntityId, EntityId>>,
    /// Held by dispatch from id translation to enqueue, and by replay
    /// while it rewrites queued payloads.
    rewrite: Mutex<()>,
    /// Held for the whole of a replay.
    replay: Mutex<()>,
    /// Set when a trigger arrives during a replay.
    rerun: AtomicBool,
    syncing: AtomicBool,
    freshness: Box<dyn Freshness>,
    max_title_len: usize,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl<S: Storage, R: RemoteExecutor> SyncEngine<S, R> {
    /// Creates an engine over an opened context.
    ///
    /// Returns the engine and a receiver for [`SyncEvent`]s that the UI
    /// layer should consume.
    pub fn new(
        ctx: SyncContext<S>,
        remote: R,
        options: &EngineOptions,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (event_tx, event_rx) = mpsc::channel(options.event_buffer.max(1));
        let temp_ids = ctx
            .queue
            .min_temp_id()
            .map_or_else(TempIdAllocator::new, TempIdAllocator::with_floor);
        let engine = Self {
            ctx,
            remote,
            conflicts: ConflictSurface::new(options.max_conflicts),
            connectivity: Connectivity::new(options.online),
            temp_ids,
            id_map: RwLock::new(HashMap::new()),
            rewrite: Mutex::new(()),
            replay: Mutex::new(()),
            rerun: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            freshness: Box::new(MaxAge(options.stale_after)),
            max_title_len: options.max_title_len,
            event_tx,
        };
        (engine, event_rx)
    }

    /// Replaces the staleness policy used by [`initial_load`](Self::initial_load).
    #[must_use]
    pub fn with_freshness(mut self, freshness: impl Freshness) -> Self {
        self.freshness = Box::new(freshness);
        self
    }

    /// Returns the queue and caches.
    #[must_use]
    pub const fn context(&self) -> &SyncContext<S> {
        &self.ctx
    }

    /// Returns the unresolved conflicts.
    #[must_use]
    pub const fn conflicts(&self) -> &ConflictSurface {
        &self.conflicts
    }

    /// Returns the online flag.
    #[must_use]
    pub const fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Returns the remote executor.
    #[must_use]
    pub const fn remote(&self) -> &R {
        &self.remote
    }

    /// Returns the state behind the offline banner, syncing indicator and
    /// conflict badge.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            online: self.connectivity.is_online(),
            syncing: self.syncing.load(Ordering::SeqCst),
            pending: self.ctx.queue.len(),
            conflicts: self.conflicts.len(),
        }
    }

    /// Returns the server id a temp id was fixed up to this session.
    #[must_use]
    pub fn resolved_id(&self, temp_id: EntityId) -> Option<EntityId> {
        self.id_map.read().get(&temp_id).copied()
    }

    fn emit(&self, event: SyncEvent) {
        // Best-effort: a slow or absent consumer never stalls sync.
        let _ = self.event_tx.try_send(event);
    }

    fn validate(&self, action: &Action) -> Result<(), ValidationError> {
        let Some(title) = action.title() else {
            return Ok(());
        };
        if title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        let len = title.chars().count();
        if len > self.max_title_len {
            return Err(ValidationError::TitleTooLong {
                len,
                max: self.max_title_len,
            });
        }
        Ok(())
    }

    /// Rewrites temp ids that were already fixed up this session.
    fn translate_ids(&self, action: &mut Action) {
        let id_map = self.id_map.read();
        if id_map.is_empty() {
            return;
        }
        for id in action.id_refs_mut() {
            if let Some(real) = id_map.get(id) {
                *id = *real;
            }
        }
    }

    /// Queue a mutation and apply it optimistically.
    ///
    /// Returns once the action is durable and the caches reflect it. If
    /// online, a replay is started in the background; dispatch does not
    /// wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for an invalid title, or
    /// [`SyncError::Store`] if the action could not be made durable (the
    /// caches are then left untouched).
    pub async fn dispatch(self: &Arc<Self>, mut action: Action) -> Result<DispatchOutcome, SyncError> {
        self.validate(&action)?;
        let kind = action.kind();
        let temp_id = kind.is_creation().then(|| self.temp_ids.next());

        let (pending, entity) = {
            let _rewrite = self.rewrite.lock().await;
            self.translate_ids(&mut action);
            if let Some(target) = action.target()
                && let Some(updated_at) = self.ctx.updated_at(kind.entity_kind(), target)
            {
                action.attach_guard(updated_at);
            }

            let pending = PendingAction::new(action, temp_id);
            self.ctx.queue.enqueue(pending.clone()).await?;
            let entity = self.ctx.apply_optimistic(&pending.action, temp_id).await;
            (pending, entity)
        };

        tracing::debug!(
            action_id = %pending.id,
            kind = %kind,
            temp_id = ?temp_id,
            "action dispatched"
        );

        if self.connectivity.is_online() {
            self.trigger();
        }

        Ok(DispatchOutcome {
            action_id: pending.id,
            temp_id,
            entity,
        })
    }

    /// Start a replay in the background.
    pub fn trigger(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = engine.process_queue().await {
                tracing::warn!(error = %err, "background replay failed");
            }
        })
    }

    /// Replay the queue against the remote executor.
    ///
    /// Returns immediately with a skipped report when offline or when a
    /// replay is already running.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] if the queue cannot be updated; the
    /// replay stops at that point.
    pub async fn process_queue(&self) -> Result<ReplayReport, SyncError> {
        let Ok(_replay) = self.replay.try_lock() else {
            self.rerun.store(true, Ordering::SeqCst);
            tracing::debug!("replay already running; trigger coalesced");
            return Ok(ReplayReport::skipped(SkipReason::AlreadyRunning));
        };
        if !self.connectivity.is_online() {
            return Ok(ReplayReport::skipped(SkipReason::Offline));
        }
        if self.ctx.queue.is_empty() {
            return Ok(ReplayReport::default());
        }

        let _syncing = SyncingGuard::enter(&self.syncing);
        self.emit(SyncEvent::ReplayStarted {
            pending: self.ctx.queue.len(),
        });

        let mut report = ReplayReport::default();
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            self.replay_pass(&mut report).await?;
            if report.halted_at.is_some()
                || !self.rerun.load(Ordering::SeqCst)
                || !self.connectivity.is_online()
            {
                break;
            }
        }

        tracing::info!(
            succeeded = report.succeeded,
            conflicted = report.conflicted,
            dropped = report.dropped,
            halted = report.halted_at.is_some(),
            remaining = self.ctx.queue.len(),
            "replay finished"
        );
        self.emit(SyncEvent::ReplayFinished(report.clone()));
        Ok(report)
    }

    /// One sequential pass over a snapshot of the queue.
    async fn replay_pass(&self, report: &mut ReplayReport) -> Result<(), SyncError> {
        for id in self.ctx.queue.ids() {
            // Re-read: earlier fixups may have rewritten this record, and a
            // resolution may have removed it.
            let Some(action) = self.ctx.queue.get(&id) else {
                continue;
            };
            if action.is_conflicted() && self.conflicts.contains(&id) {
                report.awaiting_resolution += 1;
                continue;
            }

            self.ctx
                .queue
                .update_status(&id, ActionStatus::Processing, None)
                .await?;

            match self.remote.execute(&action.action).await {
                Ok(result) => {
                    self.acknowledge(&action, result).await?;
                    report.succeeded += 1;
                }
                Err(RemoteError::Conflict { server }) => {
                    self.record_conflict(&action, server).await?;
                    report.conflicted += 1;
                }
                Err(RemoteError::Unsupported(kind)) => {
                    tracing::warn!(action_id = %id, kind = %kind, "no executor for action; dropped");
                    self.ctx.queue.remove(&id).await?;
                    report.dropped += 1;
                }
                Err(err) => {
                    let reason = err.to_string();
                    let failed = self
                        .ctx
                        .queue
                        .modify(&id, |a| {
                            a.status = ActionStatus::Failed;
                            a.failure_reason = Some(reason.clone());
                            a.retry_count = a.retry_count.saturating_add(1);
                        })
                        .await?;
                    let retry_count = failed.map_or(0, |a| a.retry_count);
                    tracing::warn!(
                        action_id = %id,
                        kind = %action.kind(),
                        retry_count,
                        error = %err,
                        "replay halted"
                    );
                    self.emit(SyncEvent::ReplayHalted {
                        action_id: id.clone(),
                        retry_count,
                        reason,
                    });
                    report.halted_at = Some(id);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Applies a server acknowledgment and removes the action.
    async fn acknowledge(&self, action: &PendingAction, result: Option<Entity>) -> Result<(), SyncError> {
        let _rewrite = self.rewrite.lock().await;
        match (action.temp_id, result) {
            (Some(temp_id), Some(entity)) => self.fixup(action, temp_id, entity).await?,
            (Some(temp_id), None) => {
                tracing::warn!(
                    action_id = %action.id,
                    temp_id = %temp_id,
                    "creation acknowledged without an entity; temp id left in place"
                );
            }
            (None, Some(entity)) => {
                self.advance_guards(action, &entity).await?;
                self.ctx.apply_entity(entity).await;
            }
            (None, None) => {
                if action.kind().is_deletion()
                    && let Some(target) = action.action.target()
                {
                    self.ctx
                        .remove_entity(action.kind().entity_kind(), target)
                        .await;
                }
            }
        }
        self.ctx.queue.remove(&action.id).await?;
        tracing::debug!(action_id = %action.id, kind = %action.kind(), "action acknowledged");
        Ok(())
    }

    /// Propagates a server id to every queued action and cached entity that
    /// still refers to `temp_id`.
    async fn fixup(&self, action: &PendingAction, temp_id: EntityId, entity: Entity) -> Result<(), SyncError> {
        let real_id = entity.id();
        if real_id == temp_id {
            self.ctx.apply_entity(entity).await;
            return Ok(());
        }
        self.id_map.write().insert(temp_id, real_id);
        let rewritten = self.ctx.queue.remap_ids(&action.id, temp_id, real_id).await?;
        self.ctx.replace_id(temp_id, entity).await;
        let remapped = self.ctx.remap_refs(temp_id, real_id).await;

        tracing::info!(
            action_id = %action.id,
            temp_id = %temp_id,
            real_id = %real_id,
            queued_rewritten = rewritten,
            cached_rewritten = remapped,
            "temp id fixed up"
        );
        self.emit(SyncEvent::IdAssigned { temp_id, real_id });
        Ok(())
    }

    /// Carries this client's acknowledged update forward to its later
    /// queued edits of the same entity, which were guarded with the
    /// version the acknowledged one replaced.
    async fn advance_guards(&self, action: &PendingAction, entity: &Entity) -> Result<(), SyncError> {
        let (Some(seen), Some(now), Some(target)) = (
            action.action.expected_updated_at(),
            entity.updated_at(),
            action.action.target(),
        ) else {
            return Ok(());
        };
        if seen == now {
            return Ok(());
        }
        self.ctx
            .queue
            .advance_guards(&action.id, action.kind().entity_kind(), target, seen, now)
            .await?;
        Ok(())
    }

    async fn record_conflict(&self, action: &PendingAction, server: Option<Entity>) -> Result<(), SyncError> {
        self.ctx
            .queue
            .update_status(&action.id, ActionStatus::Failed, Some(CONFLICT_REASON.to_string()))
            .await?;
        self.conflicts.record(ConflictInfo::new(action, server));
        tracing::info!(action_id = %action.id, kind = %action.kind(), "conflict detected");
        self.emit(SyncEvent::ConflictsChanged {
            count: self.conflicts.len(),
        });
        Ok(())
    }

    /// Settle a conflict.
    ///
    /// - [`Resolution::Server`] drops the queued action and stores the
    ///   server copy (or removes the entity if the server has none).
    /// - [`Resolution::Local`] strips the guard and replays the action.
    /// - [`Resolution::Merge`] merges the patch into the action, strips
    ///   the guard and replays it.
    ///
    /// Returns the replay that ran, for local and merge resolutions.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConflictNotFound`] if the conflict does not exist
    /// (including when it was already resolved). A merge patch that does
    /// not fit the action, or carries an invalid title, is rejected with
    /// the conflict left in place.
    pub async fn resolve_conflict(
        &self,
        action_id: &ActionId,
        resolution: Resolution,
    ) -> Result<Option<ReplayReport>, SyncError> {
        let Some(info) = self.conflicts.get(action_id) else {
            return Err(SyncError::ConflictNotFound(action_id.clone()));
        };

        let merged = match &resolution {
            Resolution::Merge(patch) => {
                let mut merged = self
                    .ctx
                    .queue
                    .get(action_id)
                    .map_or_else(|| info.local_data.clone(), |p| p.action);
                merged.merge_patch(patch.clone())?;
                self.validate(&merged)?;
                self.translate_ids(&mut merged);
                Some(merged)
            }
            Resolution::Server | Resolution::Local => None,
        };

        // Only the caller that takes the entry proceeds.
        let Some(info) = self.conflicts.take(action_id) else {
            return Err(SyncError::ConflictNotFound(action_id.clone()));
        };
        self.emit(SyncEvent::ConflictsChanged {
            count: self.conflicts.len(),
        });
        tracing::info!(action_id = %action_id, resolution = ?resolution, "resolving conflict");

        if resolution == Resolution::Server {
            self.ctx.queue.remove(action_id).await?;
            match info.server_data {
                Some(entity) => self.ctx.apply_entity(entity).await,
                None => {
                    if let Some(target) = info.local_data.target() {
                        self.ctx
                            .remove_entity(info.action_kind.entity_kind(), target)
                            .await;
                    }
                }
            }
            return Ok(None);
        }

        let requeued = self
            .ctx
            .queue
            .modify(action_id, |pending| {
                if let Some(merged) = merged.clone() {
                    pending.action = merged;
                }
                pending.action.strip_guard();
                pending.status = ActionStatus::Pending;
                pending.failure_reason = None;
            })
            .await?;
        let Some(requeued) = requeued else {
            return Err(SyncError::ActionNotFound(action_id.clone()));
        };
        if merged.is_some() {
            self.ctx.apply_optimistic(&requeued.action, None).await;
        }

        Ok(Some(self.process_queue().await?))
    }

    /// Remove a queued action without replaying it.
    ///
    /// Any conflict for it is dropped too, and an entity it created
    /// optimistically is removed from the caches.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ActionNotFound`] if the action is not queued.
    pub async fn discard(&self, action_id: &ActionId) -> Result<PendingAction, SyncError> {
        let Some(action) = self.ctx.queue.get(action_id) else {
            return Err(SyncError::ActionNotFound(action_id.clone()));
        };
        self.ctx.queue.remove(action_id).await?;
        if self.conflicts.take(action_id).is_some() {
            self.emit(SyncEvent::ConflictsChanged {
                count: self.conflicts.len(),
            });
        }
        if let Some(temp_id) = action.temp_id {
            self.ctx
                .remove_entity(action.kind().entity_kind(), temp_id)
                .await;
        }
        tracing::info!(action_id = %action_id, kind = %action.kind(), "action discarded");
        Ok(action)
    }

    /// Cold start: load caches, replay, and refresh when stale.
    ///
    /// A full refresh replaces every cache with the server snapshot. It only
    /// happens when online, when the queue drained completely (so no
    /// optimistic state is lost) and when the data is stale or `force` is set.
    /// A failed snapshot fetch is logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] if storage cannot be read.
    pub async fn initial_load(&self, force: bool) -> Result<LoadReport, SyncError> {
        let loaded = self.ctx.initialize().await?;
        let mut report = LoadReport {
            loaded,
            ..LoadReport::default()
        };
        if !self.connectivity.is_online() {
            return Ok(report);
        }

        report.replay = Some(self.process_queue().await?);
        if !self.ctx.queue.is_empty() {
            return Ok(report);
        }

        let now = now_ms();
        let last = freshness::last_full_sync(self.ctx.storage()).await?;
        if !force && !self.freshness.is_stale(last, now) {
            return Ok(report);
        }

        match self.remote.fetch_snapshot().await {
            Ok(snapshot) => {
                self.ctx.replace_all(snapshot).await;
                freshness::record_full_sync(self.ctx.storage(), now).await?;
                report.refreshed = true;
                tracing::info!(force, "caches refreshed from server");
            }
            Err(err) => {
                tracing::warn!(error = %err, "full refresh failed; keeping cached data");
            }
        }
        Ok(report)
    }

    /// React to a connectivity, focus or visibility signal.
    ///
    /// Returns the replay it ran, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Store`] if the replay fails on storage.
    pub async fn handle_signal(&self, signal: Signal) -> Result<Option<ReplayReport>, SyncError> {
        if let Signal::Online(online) = signal
            && self.connectivity.set_online(online)
        {
            tracing::info!(online, "connectivity changed");
            self.emit(SyncEvent::ConnectivityChanged { online });
        }
        if signal.triggers_replay() && self.connectivity.is_online() {
            return Ok(Some(self.process_queue().await?));
        }
        Ok(None)
    }

    /// Consume signals until the sender side is dropped.
    pub fn spawn_signal_listener(
        self: &Arc<Self>,
        mut signals: mpsc::Receiver<Signal>,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                if let Err(err) = engine.handle_signal(signal).await {
                    tracing::warn!(?signal, error = %err, "signal handling failed");
                }
            }
        })
    }
}
