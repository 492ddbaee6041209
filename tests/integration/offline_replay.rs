//! Integration tests for offline capture and queue replay.
//!
//! Covers optimistic dispatch while offline, replay on reconnect, temp-id
//! fixup across dependent queued actions, and strict replay ordering.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tasksync::remote::{MemoryRemote, RemoteError};
use tasksync::store::{MemoryStorage, Namespace, Storage, StoreError, WriteBatch};
use tasksync::sync::{EngineOptions, Signal, SkipReason, SyncContext, SyncEngine, SyncEvent};
use tasksync_proto::action::{Action, NamedDraft, SubtaskDraft, TaskDraft, TaskPatch, Update};
use tasksync_proto::entity::EntityId;
use tasksync_proto::pending::ActionStatus;

type Engine = SyncEngine<MemoryStorage, MemoryRemote>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Builds an offline engine over fresh storage and a fresh server.
async fn offline_engine() -> (Arc<Engine>, mpsc::Receiver<SyncEvent>, MemoryRemote) {
    let (ctx, _warnings) = SyncContext::open(MemoryStorage::new(), 16).await.unwrap();
    let remote = MemoryRemote::new();
    let options = EngineOptions {
        online: false,
        ..EngineOptions::default()
    };
    let (engine, events) = SyncEngine::new(ctx, remote.clone(), &options);
    (Arc::new(engine), events, remote)
}

/// Memory storage whose queue writes take a while to land.
#[derive(Clone, Default)]
struct SlowQueue {
    inner: MemoryStorage,
}

impl Storage for SlowQueue {
    async fn scan(&self, ns: Namespace) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.inner.scan(ns).await
    }

    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(ns, key).await
    }

    async fn write_batch(&self, ns: Namespace, batch: WriteBatch) -> Result<(), StoreError> {
        if ns == Namespace::Queue {
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        self.inner.write_batch(ns, batch).await
    }
}

/// Waits for background replays to drain the queue.
async fn settle<S: Storage>(engine: &Arc<SyncEngine<S, MemoryRemote>>) {
    for _ in 0..200 {
        if engine.context().queue.is_empty() && !engine.status().syncing {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn drain(events: &mut mpsc::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

fn rename(id: EntityId, title: &str) -> Action {
    Action::UpdateTask(Update::new(
        id,
        TaskPatch {
            title: Some(title.to_string()),
            ..TaskPatch::default()
        },
    ))
}

// ---------------------------------------------------------------------------
// Offline capture and reconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offline_create_is_visible_immediately() {
    let (engine, _events, remote) = offline_engine().await;

    let outcome = engine
        .dispatch(Action::CreateTask(TaskDraft::titled("Buy milk")))
        .await
        .unwrap();

    let temp = outcome.temp_id.unwrap();
    assert!(temp.is_temp());
    let cached = engine.context().tasks.get(temp).unwrap();
    assert_eq!(cached.title, "Buy milk");
    assert_eq!(engine.context().queue.len(), 1);
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn reconnect_replays_and_swaps_temp_id() {
    let (engine, mut events, remote) = offline_engine().await;
    let outcome = engine
        .dispatch(Action::CreateTask(TaskDraft::titled("Buy milk")))
        .await
        .unwrap();
    let temp = outcome.temp_id.unwrap();

    let report = engine
        .handle_signal(Signal::Online(true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.succeeded, 1);

    let tasks = engine.context().tasks.all();
    assert_eq!(tasks.len(), 1);
    assert!(!tasks[0].id.is_temp());
    assert_eq!(tasks[0].title, "Buy milk");
    assert!(engine.context().tasks.get(temp).is_none());
    assert!(engine.context().queue.is_empty());
    assert_eq!(remote.task(tasks[0].id).unwrap().title, "Buy milk");

    let events = drain(&mut events);
    assert!(events.contains(&SyncEvent::IdAssigned {
        temp_id: temp,
        real_id: tasks[0].id,
    }));
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SyncEvent::ReplayFinished(r) if r.succeeded == 1))
    );
}

#[tokio::test]
async fn status_tracks_offline_banner_and_pending_count() {
    let (engine, _events, _remote) = offline_engine().await;
    engine
        .dispatch(Action::CreateList(NamedDraft::named("Home")))
        .await
        .unwrap();

    let status = engine.status();
    assert!(!status.online);
    assert!(!status.syncing);
    assert_eq!(status.pending, 1);
    assert_eq!(status.conflicts, 0);

    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.skipped, Some(SkipReason::Offline));
    assert_eq!(engine.status().pending, 1);
}

// ---------------------------------------------------------------------------
// Temp-id fixup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fixup_rewrites_nested_references_in_queued_payloads() {
    let (engine, _events, remote) = offline_engine().await;

    let urgent = engine
        .dispatch(Action::CreateLabel(NamedDraft::named("urgent")))
        .await
        .unwrap()
        .temp_id
        .unwrap();
    let home = engine
        .dispatch(Action::CreateLabel(NamedDraft::named("home")))
        .await
        .unwrap()
        .temp_id
        .unwrap();
    let mut draft = TaskDraft::titled("sweep");
    draft.label_ids = vec![home, urgent];
    let task = engine
        .dispatch(Action::CreateTask(draft))
        .await
        .unwrap()
        .temp_id
        .unwrap();

    engine.connectivity().set_online(true);
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 3);

    let real_urgent = engine.resolved_id(urgent).unwrap();
    let real_home = engine.resolved_id(home).unwrap();
    let real_task = engine.resolved_id(task).unwrap();

    // The server saw the labels in the same positions.
    let created = remote.task(real_task).unwrap();
    assert_eq!(created.label_ids, vec![real_home, real_urgent]);

    let cached = engine.context().tasks.get(real_task).unwrap();
    assert_eq!(cached.label_ids, vec![real_home, real_urgent]);
    assert!(engine.context().labels.all().iter().all(|l| !l.id.is_temp()));
}

#[tokio::test]
async fn dispatch_during_fixup_sees_the_server_id() {
    let (ctx, _warnings) = SyncContext::open(SlowQueue::default(), 16).await.unwrap();
    let remote = MemoryRemote::new();
    let options = EngineOptions {
        online: false,
        ..EngineOptions::default()
    };
    let (engine, _events) = SyncEngine::new(ctx, remote.clone(), &options);
    let engine = Arc::new(engine);

    let list = engine
        .dispatch(Action::CreateList(NamedDraft::named("Errands")))
        .await
        .unwrap()
        .temp_id
        .unwrap();
    engine
        .dispatch(Action::CreateTask(TaskDraft {
            list_id: Some(list),
            ..TaskDraft::titled("stamps")
        }))
        .await
        .unwrap();

    engine.connectivity().set_online(true);
    let replay = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.process_queue().await })
    };
    // Lands while the list's acknowledgment is rewriting the queue.
    tokio::time::sleep(Duration::from_millis(60)).await;
    engine
        .dispatch(Action::CreateTask(TaskDraft {
            list_id: Some(list),
            ..TaskDraft::titled("envelopes")
        }))
        .await
        .unwrap();
    replay.await.unwrap().unwrap();
    settle(&engine).await;

    assert!(engine.context().queue.is_empty());
    let real_list = engine.resolved_id(list).unwrap();
    let stored = remote.tasks();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|t| t.list_id == Some(real_list)));
    assert!(
        engine
            .context()
            .tasks
            .all()
            .iter()
            .all(|t| t.list_id == Some(real_list) && !t.id.is_temp())
    );
}

#[tokio::test]
async fn halted_replay_keeps_fixed_up_payloads() {
    let (engine, mut events, remote) = offline_engine().await;

    let parent = engine
        .dispatch(Action::CreateTask(TaskDraft::titled("parent")))
        .await
        .unwrap()
        .temp_id
        .unwrap();
    // The server has never heard of task 999: this one is refused.
    let doomed = engine
        .dispatch(rename(EntityId::new(999), "ghost"))
        .await
        .unwrap();
    let child = engine
        .dispatch(Action::CreateSubtask(SubtaskDraft {
            task_id: parent,
            title: "child".into(),
        }))
        .await
        .unwrap();

    engine.connectivity().set_online(true);
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.halted_at, Some(doomed.action_id.clone()));
    let real = engine.resolved_id(parent).unwrap();

    // The child was never sent but its durable payload names the server id.
    let queued = engine.context().queue.get(&child.action_id).unwrap();
    assert_eq!(queued.action.id_refs(), vec![real]);
    assert_eq!(queued.status, ActionStatus::Pending);

    let failed = engine.context().queue.get(&doomed.action_id).unwrap();
    assert_eq!(failed.status, ActionStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert!(failed.failure_reason.is_some());
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        SyncEvent::ReplayHalted { action_id, retry_count: 1, .. } if *action_id == doomed.action_id
    )));

    // The cache moved the parent to its server id.
    assert!(engine.context().tasks.get(parent).is_none());
    assert!(engine.context().tasks.get(real).is_some());

    // Retrying halts again; discarding unblocks the rest of the queue.
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 0);
    assert_eq!(
        engine.context().queue.get(&doomed.action_id).unwrap().retry_count,
        2
    );

    engine.discard(&doomed.action_id).await.unwrap();
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(engine.context().queue.is_empty());

    let stored = remote.task(real).unwrap();
    assert_eq!(stored.subtasks.len(), 1);
    assert_eq!(stored.subtasks[0].title, "child");
    let cached = engine.context().tasks.get(real).unwrap();
    assert_eq!(cached.subtasks.len(), 1);
    assert!(!cached.subtasks[0].id.is_temp());
}

#[tokio::test]
async fn server_outage_halts_without_losing_actions() {
    let (engine, _events, remote) = offline_engine().await;
    engine
        .dispatch(Action::CreateList(NamedDraft::named("Home")))
        .await
        .unwrap();

    engine.connectivity().set_online(true);
    remote.fail_next(RemoteError::Unavailable("gateway timeout".into()));
    let report = engine.process_queue().await.unwrap();
    assert!(report.halted_at.is_some());
    assert_eq!(engine.context().queue.len(), 1);
    assert_eq!(engine.context().lists.len(), 1);

    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(engine.context().queue.is_empty());
    assert!(!engine.context().lists.all()[0].id.is_temp());
}

// ---------------------------------------------------------------------------
// Ordering and exclusivity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replay_is_sequential_in_queue_order() {
    let (engine, _events, remote) = offline_engine().await;
    // Not cached locally, so the edits carry no guard.
    let seeded = remote.seed_task(TaskDraft::titled("t").to_task(EntityId::new(0)));

    for title in ["one", "two", "three"] {
        engine.dispatch(rename(seeded.id, title)).await.unwrap();
    }

    remote.set_latency(Duration::from_millis(5));
    engine.connectivity().set_online(true);
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 3);

    let titles: Vec<String> = remote
        .calls()
        .iter()
        .filter_map(|a| a.title().map(str::to_string))
        .collect();
    assert_eq!(titles, vec!["one", "two", "three"]);
    assert_eq!(remote.max_in_flight(), 1);
    assert_eq!(remote.task(seeded.id).unwrap().title, "three");
    assert_eq!(engine.context().tasks.get(seeded.id).unwrap().title, "three");
}

#[tokio::test]
async fn consecutive_edits_of_a_cached_task_all_apply() {
    let (engine, _events, remote) = offline_engine().await;
    let seeded = remote.seed_task(TaskDraft::titled("t").to_task(EntityId::new(0)));
    engine.context().tasks.upsert_one(seeded.clone()).await;

    for title in ["one", "two", "three"] {
        let outcome = engine.dispatch(rename(seeded.id, title)).await.unwrap();
        let queued = engine.context().queue.get(&outcome.action_id).unwrap();
        assert_eq!(queued.action.expected_updated_at(), seeded.updated_at);
    }

    engine.connectivity().set_online(true);
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.conflicted, 0);
    assert!(engine.conflicts().is_empty());

    let stored = remote.task(seeded.id).unwrap();
    assert_eq!(stored.title, "three");
    assert_eq!(engine.context().tasks.get(seeded.id).unwrap(), stored);

    // A change by someone else in between still conflicts.
    engine.connectivity().set_online(false);
    engine.dispatch(rename(seeded.id, "four")).await.unwrap();
    remote.edit_task(seeded.id, |t| t.completed = true).unwrap();
    engine.connectivity().set_online(true);
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.conflicted, 1);
}

#[tokio::test]
async fn racing_triggers_never_run_in_parallel() {
    let (engine, _events, remote) = offline_engine().await;
    for i in 0..5 {
        engine
            .dispatch(Action::CreateTask(TaskDraft::titled(format!("task {i}"))))
            .await
            .unwrap();
    }
    remote.set_latency(Duration::from_millis(10));
    engine.connectivity().set_online(true);

    let (a, b, c) = tokio::join!(
        engine.process_queue(),
        engine.handle_signal(Signal::Focus),
        engine.handle_signal(Signal::Visible(true)),
    );
    let ran = [
        a.unwrap(),
        b.unwrap().unwrap(),
        c.unwrap().unwrap(),
    ]
    .into_iter()
    .filter(|r| r.ran())
    .count();

    assert_eq!(ran, 1);
    assert_eq!(remote.max_in_flight(), 1);
    assert_eq!(remote.calls().len(), 5);
    assert!(engine.context().queue.is_empty());
    assert!(!engine.status().syncing);
}

#[tokio::test]
async fn dispatch_while_online_replays_in_background() {
    let (engine, _events, remote) = offline_engine().await;
    engine.connectivity().set_online(true);

    engine
        .dispatch(Action::CreateTask(TaskDraft::titled("first")))
        .await
        .unwrap();
    engine
        .dispatch(Action::CreateTask(TaskDraft::titled("second")))
        .await
        .unwrap();

    settle(&engine).await;
    assert!(engine.context().queue.is_empty());
    assert_eq!(remote.tasks().len(), 2);
    assert!(engine.context().tasks.all().iter().all(|t| !t.id.is_temp()));
}

#[tokio::test]
async fn temp_ids_are_unique_across_a_burst() {
    let (engine, _events, _remote) = offline_engine().await;
    let mut seen = HashSet::new();
    for i in 0..50 {
        let outcome = engine
            .dispatch(Action::CreateTask(TaskDraft::titled(format!("t{i}"))))
            .await
            .unwrap();
        let temp = outcome.temp_id.unwrap();
        assert!(temp.is_temp());
        assert!(seen.insert(temp));
    }
    assert_eq!(engine.context().tasks.len(), 50);
}

#[tokio::test]
async fn signal_listener_reacts_to_reconnect() {
    let (engine, _events, remote) = offline_engine().await;
    engine
        .dispatch(Action::CreateTask(TaskDraft::titled("queued")))
        .await
        .unwrap();

    let (tx, rx) = mpsc::channel(4);
    let listener = engine.spawn_signal_listener(rx);
    tx.send(Signal::Online(true)).await.unwrap();
    drop(tx);
    listener.await.unwrap();

    assert!(engine.context().queue.is_empty());
    assert_eq!(remote.tasks().len(), 1);
}
