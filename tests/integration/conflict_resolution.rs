//! Integration tests for optimistic-concurrency conflicts.
//!
//! A queued update carries the `updated_at` the client last saw. When
//! another client changed or deleted the entity in the meantime, replay
//! surfaces a conflict which the user settles with a [`Resolution`].

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use tokio::sync::mpsc;

use tasksync::remote::MemoryRemote;
use tasksync::store::MemoryStorage;
use tasksync::sync::{EngineOptions, Resolution, SyncContext, SyncEngine, SyncError, SyncEvent};
use tasksync_proto::action::{Action, NamedDraft, NamedPatch, Patch, TaskDraft, TaskPatch, Update};
use tasksync_proto::entity::{Entity, EntityId, Task};
use tasksync_proto::pending::{ActionId, ActionStatus, CONFLICT_REASON};

type Engine = SyncEngine<MemoryStorage, MemoryRemote>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// An engine whose cache holds one task fetched from the server, then
/// taken offline.
async fn synced_engine(
    max_conflicts: usize,
) -> (Arc<Engine>, mpsc::Receiver<SyncEvent>, MemoryRemote, Task) {
    let remote = MemoryRemote::new();
    let seeded = remote.seed_task(TaskDraft::titled("Draft report").to_task(EntityId::new(0)));

    let (ctx, _warnings) = SyncContext::open(MemoryStorage::new(), 16).await.unwrap();
    let options = EngineOptions {
        online: true,
        max_conflicts,
        ..EngineOptions::default()
    };
    let (engine, events) = SyncEngine::new(ctx, remote.clone(), &options);
    let engine = Arc::new(engine);

    let load = engine.initial_load(true).await.unwrap();
    assert!(load.refreshed);
    assert_eq!(engine.context().tasks.get(seeded.id), Some(seeded.clone()));

    engine.connectivity().set_online(false);
    (engine, events, remote, seeded)
}

fn retitle(id: EntityId, title: &str) -> Action {
    Action::UpdateTask(Update::new(
        id,
        TaskPatch {
            title: Some(title.to_string()),
            ..TaskPatch::default()
        },
    ))
}

/// Another client edits the task, then this client edits it offline and
/// reconnects.
async fn conflicted_edit(
    engine: &Arc<Engine>,
    remote: &MemoryRemote,
    seeded: &Task,
) -> ActionId {
    remote
        .edit_task(seeded.id, |t| t.title = "Final report".into())
        .unwrap();
    let outcome = engine.dispatch(retitle(seeded.id, "My report")).await.unwrap();
    let queued = engine.context().queue.get(&outcome.action_id).unwrap();
    assert_eq!(queued.action.expected_updated_at(), seeded.updated_at);

    engine.connectivity().set_online(true);
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.conflicted, 1);
    assert_eq!(report.succeeded, 0);
    outcome.action_id
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_guard_surfaces_conflict_with_server_copy() {
    let (engine, mut events, remote, seeded) = synced_engine(100).await;
    let action_id = conflicted_edit(&engine, &remote, &seeded).await;

    let queued = engine.context().queue.get(&action_id).unwrap();
    assert_eq!(queued.status, ActionStatus::Failed);
    assert_eq!(queued.failure_reason.as_deref(), Some(CONFLICT_REASON));
    assert!(queued.is_conflicted());

    let conflict = engine.conflicts().get(&action_id).unwrap();
    let Some(Entity::Task(server)) = &conflict.server_data else {
        panic!("expected the server's task in the conflict");
    };
    assert_eq!(server.title, "Final report");
    assert_ne!(server.updated_at, seeded.updated_at);
    assert_eq!(conflict.local_data, queued.action);

    // The optimistic edit stays visible until the user decides.
    assert_eq!(engine.context().tasks.get(seeded.id).unwrap().title, "My report");
    assert_eq!(engine.status().conflicts, 1);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&SyncEvent::ConflictsChanged { count: 1 }));
}

#[tokio::test]
async fn conflict_does_not_block_later_actions() {
    let (engine, _events, remote, seeded) = synced_engine(100).await;
    remote
        .edit_task(seeded.id, |t| t.completed = true)
        .unwrap();
    let conflicted = engine.dispatch(retitle(seeded.id, "mine")).await.unwrap();
    engine
        .dispatch(Action::CreateList(NamedDraft::named("Work")))
        .await
        .unwrap();

    engine.connectivity().set_online(true);
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.conflicted, 1);
    assert_eq!(report.succeeded, 1);
    assert!(report.halted_at.is_none());
    assert_eq!(engine.context().queue.len(), 1);

    // While surfaced, the conflicted action is not retried.
    let calls = remote.calls().len();
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.awaiting_resolution, 1);
    assert_eq!(report.conflicted, 0);
    assert_eq!(remote.calls().len(), calls);
    assert!(engine.conflicts().contains(&conflicted.action_id));
}

#[tokio::test]
async fn server_side_delete_conflicts_without_server_copy() {
    let (engine, _events, remote, seeded) = synced_engine(100).await;
    remote.remove_task(seeded.id).unwrap();
    let outcome = engine.dispatch(retitle(seeded.id, "still here?")).await.unwrap();

    engine.connectivity().set_online(true);
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.conflicted, 1);

    let conflict = engine.conflicts().get(&outcome.action_id).unwrap();
    assert_eq!(conflict.server_data, None);

    // Taking the server's side removes the task locally too.
    let replay = engine
        .resolve_conflict(&outcome.action_id, Resolution::Server)
        .await
        .unwrap();
    assert!(replay.is_none());
    assert!(engine.context().tasks.get(seeded.id).is_none());
    assert!(engine.context().queue.is_empty());
    assert!(engine.conflicts().is_empty());
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resolve_with_server_discards_local_change() {
    let (engine, _events, remote, seeded) = synced_engine(100).await;
    let action_id = conflicted_edit(&engine, &remote, &seeded).await;

    engine
        .resolve_conflict(&action_id, Resolution::Server)
        .await
        .unwrap();

    assert!(engine.context().queue.is_empty());
    assert!(engine.conflicts().is_empty());
    let cached = engine.context().tasks.get(seeded.id).unwrap();
    assert_eq!(cached.title, "Final report");
    assert_eq!(cached, remote.task(seeded.id).unwrap());
}

#[tokio::test]
async fn resolve_with_local_overwrites_server() {
    let (engine, _events, remote, seeded) = synced_engine(100).await;
    let action_id = conflicted_edit(&engine, &remote, &seeded).await;

    let replay = engine
        .resolve_conflict(&action_id, Resolution::Local)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replay.succeeded, 1);

    let stored = remote.task(seeded.id).unwrap();
    assert_eq!(stored.title, "My report");
    assert!(engine.context().queue.is_empty());
    assert!(engine.conflicts().is_empty());
    assert_eq!(engine.context().tasks.get(seeded.id).unwrap(), stored);

    // The forced write carried no guard.
    let last = remote.calls().pop().unwrap();
    assert_eq!(last.expected_updated_at(), None);
}

#[tokio::test]
async fn resolve_with_merge_adds_fields_and_replays() {
    let (engine, _events, remote, seeded) = synced_engine(100).await;
    let action_id = conflicted_edit(&engine, &remote, &seeded).await;

    let patch = Patch::Task(TaskPatch {
        notes: Some(Some("kept both".into())),
        ..TaskPatch::default()
    });
    let replay = engine
        .resolve_conflict(&action_id, Resolution::Merge(patch))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replay.succeeded, 1);

    let stored = remote.task(seeded.id).unwrap();
    assert_eq!(stored.title, "My report");
    assert_eq!(stored.notes.as_deref(), Some("kept both"));
    assert_eq!(engine.context().tasks.get(seeded.id).unwrap(), stored);
}

#[tokio::test]
async fn mismatched_merge_leaves_conflict_in_place() {
    let (engine, _events, remote, seeded) = synced_engine(100).await;
    let action_id = conflicted_edit(&engine, &remote, &seeded).await;

    let err = engine
        .resolve_conflict(
            &action_id,
            Resolution::Merge(Patch::Named(NamedPatch {
                name: Some("nope".into()),
                ..NamedPatch::default()
            })),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::PatchMismatch(_)));
    assert!(engine.conflicts().contains(&action_id));
    assert!(engine.context().queue.get(&action_id).unwrap().is_conflicted());
}

#[tokio::test]
async fn resolving_twice_is_rejected() {
    let (engine, _events, remote, seeded) = synced_engine(100).await;
    let action_id = conflicted_edit(&engine, &remote, &seeded).await;

    engine
        .resolve_conflict(&action_id, Resolution::Local)
        .await
        .unwrap();
    let calls = remote.calls().len();

    let err = engine
        .resolve_conflict(&action_id, Resolution::Local)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ConflictNotFound(id) if id == action_id));
    assert_eq!(remote.calls().len(), calls);
}

#[tokio::test]
async fn full_conflict_surface_keeps_every_action_queued() {
    let (engine, _events, remote, seeded) = synced_engine(1).await;
    let other = remote.seed_task(TaskDraft::titled("Other").to_task(EntityId::new(0)));
    engine.context().tasks.upsert_one(other.clone()).await;

    remote.edit_task(seeded.id, |t| t.completed = true).unwrap();
    remote.edit_task(other.id, |t| t.completed = true).unwrap();
    let first = engine.dispatch(retitle(seeded.id, "a")).await.unwrap();
    let second = engine.dispatch(retitle(other.id, "b")).await.unwrap();

    engine.connectivity().set_online(true);
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.conflicted, 2);

    // Only the newest conflict is surfaced; the evicted one stays queued
    // and conflicts again on the next replay.
    assert_eq!(engine.conflicts().len(), 1);
    assert!(engine.conflicts().contains(&second.action_id));
    assert!(engine.context().queue.get(&first.action_id).is_some());

    let report = engine.process_queue().await.unwrap();
    assert!(report.conflicted >= 1);
    assert_eq!(engine.conflicts().len(), 1);
    assert_eq!(engine.context().queue.len(), 2);
}
