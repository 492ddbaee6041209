//! Configuration system for the `tasksync` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/tasksync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::sync::EngineOptions;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    storage: StorageFileConfig,
    sync: SyncFileConfig,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    db_path: Option<PathBuf>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    max_conflicts: Option<usize>,
    max_title_len: Option<usize>,
    event_buffer: Option<usize>,
    warning_buffer: Option<usize>,
    persist_retry_secs: Option<u64>,
    stale_after_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Sync subsystem configuration (used by `SyncEngine`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Capacity of the conflict list.
    pub max_conflicts: usize,
    /// Maximum title or name length in characters.
    pub max_title_len: usize,
    /// Buffer size for the `SyncEvent` channel.
    pub event_buffer: usize,
    /// Buffer size for the cache persistence warning channel.
    pub warning_buffer: usize,
    /// Interval between retries of failed cache writes.
    pub persist_retry: Duration,
    /// Age after which a cold start refetches everything.
    pub stale_after: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_conflicts: 100,
            max_title_len: 256,
            event_buffer: 256,
            warning_buffer: 16,
            persist_retry: Duration::from_secs(30),
            stale_after: Duration::from_secs(5 * 60),
        }
    }
}

impl SyncConfig {
    /// Engine options for this configuration.
    #[must_use]
    pub fn engine_options(&self, online: bool) -> EngineOptions {
        EngineOptions {
            max_title_len: self.max_title_len,
            max_conflicts: self.max_conflicts,
            event_buffer: self.event_buffer,
            stale_after: self.stale_after,
            online,
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path of the `SQLite` database holding the queue and caches.
    pub db_path: PathBuf,
    /// Sync engine tuning.
    pub sync: SyncConfig,
}

/// Default database location: `<data dir>/tasksync/tasksync.db`.
fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .map_or_else(|| PathBuf::from("."), |dir| dir.join("tasksync"))
        .join("tasksync.db")
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if the default config file exists but is invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let sync = &file.sync;

        Self {
            db_path: cli
                .db_path
                .clone()
                .or_else(|| file.storage.db_path.clone())
                .unwrap_or(defaults.db_path),
            sync: SyncConfig {
                max_conflicts: sync.max_conflicts.unwrap_or(defaults.sync.max_conflicts),
                max_title_len: sync.max_title_len.unwrap_or(defaults.sync.max_title_len),
                event_buffer: sync.event_buffer.unwrap_or(defaults.sync.event_buffer),
                warning_buffer: sync.warning_buffer.unwrap_or(defaults.sync.warning_buffer),
                persist_retry: sync
                    .persist_retry_secs
                    .map_or(defaults.sync.persist_retry, |s| Duration::from_secs(s.max(1))),
                stale_after: sync
                    .stale_after_secs
                    .map_or(defaults.sync.stale_after, Duration::from_secs),
            },
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Offline-first task capture with deferred sync")]
pub struct CliArgs {
    /// Path to the database file.
    #[arg(long, env = "TASKSYNC_DB")]
    pub db_path: Option<PathBuf>,

    /// Path to config file (default: `~/.config/tasksync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TASKSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/tasksync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// What to do (default: `status`).
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands. Ids may be negative (not yet synced).
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Queue a new task.
    #[command(allow_negative_numbers = true)]
    AddTask {
        /// Task title.
        title: String,
        /// Free-form notes.
        #[arg(long)]
        notes: Option<String>,
        /// List to file the task under.
        #[arg(long)]
        list: Option<i64>,
        /// Label to attach (repeatable).
        #[arg(long = "label")]
        labels: Vec<i64>,
    },
    /// Queue an edit to a task.
    #[command(allow_negative_numbers = true)]
    EditTask {
        /// Task id.
        id: i64,
        /// New title.
        #[arg(long)]
        title: Option<String>,
        /// New notes.
        #[arg(long)]
        notes: Option<String>,
        /// Move to this list.
        #[arg(long)]
        list: Option<i64>,
    },
    /// Mark a task done (or not done with `--undo`).
    #[command(allow_negative_numbers = true)]
    CompleteTask {
        /// Task id.
        id: i64,
        /// Reopen instead.
        #[arg(long)]
        undo: bool,
    },
    /// Queue a task deletion.
    #[command(allow_negative_numbers = true)]
    RmTask {
        /// Task id.
        id: i64,
    },
    /// Queue a new subtask.
    #[command(allow_negative_numbers = true)]
    AddSubtask {
        /// Parent task id.
        task_id: i64,
        /// Subtask title.
        title: String,
    },
    /// Queue a new list.
    AddList {
        /// List name.
        name: String,
        /// Display color.
        #[arg(long)]
        color: Option<String>,
    },
    /// Queue a new label.
    AddLabel {
        /// Label name.
        name: String,
        /// Display color.
        #[arg(long)]
        color: Option<String>,
    },
    /// Print queued actions as JSON lines.
    Queue,
    /// Print cached entities as JSON.
    Show,
    /// Print pending and conflict counts.
    Status,
    /// Drop a queued action without syncing it.
    Discard {
        /// Action id (UUID).
        action_id: String,
    },
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("tasksync").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
