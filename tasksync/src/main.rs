//! `tasksync`: offline task capture against the local sync store.
//!
//! Every command works without a backend: mutations are queued durably and
//! applied to the local cache, ready to be replayed once a sync engine with
//! a reachable server runs over the same database.
//!
//! ```bash
//! tasksync add-list Groceries
//! tasksync add-task "Buy milk" --list -1700000000000
//! tasksync queue
//! tasksync status
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use tasksync::config::{CliArgs, ClientConfig, Command};
use tasksync::remote::Unreachable;
use tasksync::store::{SqliteStorage, StoreError};
use tasksync::sync::{DispatchOutcome, SyncContext, SyncEngine, SyncError};
use tasksync_proto::action::{Action, NamedDraft, SubtaskDraft, TaskDraft, TaskPatch, Update};
use tasksync_proto::entity::EntityId;
use tasksync_proto::pending::ActionId;

/// Errors surfaced to the user by the CLI.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("cannot format output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid action id {0:?}")]
    InvalidActionId(String),

    #[error("nothing to change: pass --title, --notes or --list")]
    EmptyEdit,
}

type Engine = SyncEngine<SqliteStorage, Unreachable>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    match run(cli.command.unwrap_or(Command::Status), &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based tracing.
///
/// Returns a guard that must be held until shutdown to flush logs.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("tasksync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(command: Command, config: &ClientConfig) -> Result<(), CliError> {
    let storage = SqliteStorage::open(&config.db_path)?;
    let (ctx, _warnings) = SyncContext::open(storage, config.sync.warning_buffer).await?;
    let (engine, _events) = SyncEngine::new(ctx, Unreachable, &config.sync.engine_options(false));
    let engine = Arc::new(engine);
    let retry = engine
        .context()
        .writer()
        .spawn_retry_task(config.sync.persist_retry);
    engine.initial_load(false).await?;
    tracing::debug!(db = %config.db_path.display(), ?command, "running command");

    match command {
        Command::AddTask {
            title,
            notes,
            list,
            labels,
        } => {
            let draft = TaskDraft {
                title,
                notes,
                list_id: list.map(EntityId::new),
                label_ids: labels.into_iter().map(EntityId::new).collect(),
            };
            dispatch(&engine, Action::CreateTask(draft)).await?;
        }
        Command::EditTask {
            id,
            title,
            notes,
            list,
        } => {
            if title.is_none() && notes.is_none() && list.is_none() {
                return Err(CliError::EmptyEdit);
            }
            let patch = TaskPatch {
                title,
                notes: notes.map(Some),
                list_id: list.map(|l| Some(EntityId::new(l))),
                ..TaskPatch::default()
            };
            let update = Update::new(EntityId::new(id), patch);
            dispatch(&engine, Action::UpdateTask(update)).await?;
        }
        Command::CompleteTask { id, undo } => {
            let patch = TaskPatch {
                completed: Some(!undo),
                ..TaskPatch::default()
            };
            let update = Update::new(EntityId::new(id), patch);
            dispatch(&engine, Action::UpdateTask(update)).await?;
        }
        Command::RmTask { id } => {
            dispatch(&engine, Action::DeleteTask(EntityId::new(id))).await?;
        }
        Command::AddSubtask { task_id, title } => {
            let draft = SubtaskDraft {
                task_id: EntityId::new(task_id),
                title,
            };
            dispatch(&engine, Action::CreateSubtask(draft)).await?;
        }
        Command::AddList { name, color } => {
            let draft = NamedDraft { name, color };
            dispatch(&engine, Action::CreateList(draft)).await?;
        }
        Command::AddLabel { name, color } => {
            let draft = NamedDraft { name, color };
            dispatch(&engine, Action::CreateLabel(draft)).await?;
        }
        Command::Queue => {
            for pending in engine.context().queue.list() {
                println!("{}", serde_json::to_string(&pending)?);
            }
        }
        Command::Show => {
            let ctx = engine.context();
            let snapshot = serde_json::json!({
                "tasks": ctx.tasks.all(),
                "lists": ctx.lists.all(),
                "labels": ctx.labels.all(),
            });
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Status => {
            let status = engine.status();
            let failed = engine
                .context()
                .queue
                .list()
                .iter()
                .filter(|p| p.failure_reason.is_some())
                .count();
            println!("online:   {}", status.online);
            println!("pending:  {}", status.pending);
            println!("failed:   {failed}");
            println!("database: {}", config.db_path.display());
        }
        Command::Discard { action_id } => {
            let id: ActionId = action_id
                .parse()
                .map_err(|_| CliError::InvalidActionId(action_id.clone()))?;
            let discarded = engine.discard(&id).await?;
            println!("discarded {} ({})", discarded.id, discarded.kind());
        }
    }

    // Give failed cache writes one more chance before exiting.
    retry.abort();
    engine.context().writer().flush_pending().await;
    Ok(())
}

async fn dispatch(engine: &Arc<Engine>, action: Action) -> Result<(), CliError> {
    let DispatchOutcome {
        action_id,
        temp_id,
        entity,
    } = engine.dispatch(action).await?;
    let out = serde_json::json!({
        "action_id": action_id.to_string(),
        "temp_id": temp_id,
        "entity": entity,
    });
    println!("{}", serde_json::to_string(&out)?);
    Ok(())
}
