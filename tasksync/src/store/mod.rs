//! Durable key-value storage for queue records and cached entities.
//!
//! Defines the [`Storage`] trait that every backend must satisfy, plus the
//! [`QueueStore`] built on top of it. Concrete backends:
//! - [`memory::MemoryStorage`]: shared in-process store for testing
//! - [`sqlite::SqliteStorage`]: single-file `SQLite` database

pub mod memory;
pub mod queue;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use queue::QueueStore;
pub use sqlite::SqliteStorage;

use tasksync_proto::codec::CodecError;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read operation failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// A record could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Logical table a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Pending actions, in dispatch order.
    Queue,
    /// Cached tasks.
    Tasks,
    /// Cached lists.
    Lists,
    /// Cached labels.
    Labels,
    /// Bookkeeping values such as the last full-sync time.
    Meta,
}

impl Namespace {
    /// Returns the stable on-disk name of this namespace.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Tasks => "tasks",
            Self::Lists => "lists",
            Self::Labels => "labels",
            Self::Meta => "meta",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite `key`. Overwrites keep the original insertion position.
    Put(String, Vec<u8>),
    /// Remove `key`. Removing a missing key is not an error.
    Delete(String),
}

impl WriteOp {
    /// Returns the key this op touches.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put(key, _) | Self::Delete(key) => key,
        }
    }
}

/// A group of writes to one namespace that must apply atomically.
///
/// If `clear` is set, every existing record in the namespace is removed
/// before `ops` are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    /// Wipe the namespace first.
    pub clear: bool,
    /// Writes applied in order.
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a batch that replaces the whole namespace.
    #[must_use]
    pub fn replace_all() -> Self {
        Self {
            clear: true,
            ops: Vec::new(),
        }
    }

    /// Appends a put.
    #[must_use]
    pub fn put(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.ops.push(WriteOp::Put(key.into(), value));
        self
    }

    /// Appends a delete.
    #[must_use]
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Delete(key.into()));
        self
    }

    /// Returns `true` if applying this batch would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.clear && self.ops.is_empty()
    }

    /// Drops the parts of this (older) batch that `newer` overwrites.
    ///
    /// A clearing batch supersedes everything; otherwise ops on keys that
    /// `newer` also touches are removed.
    pub fn supersede_with(&mut self, newer: &Self) {
        if newer.clear {
            self.clear = false;
            self.ops.clear();
            return;
        }
        self.ops
            .retain(|op| !newer.ops.iter().any(|n| n.key() == op.key()));
    }
}

/// Async key-value storage with per-namespace insertion ordering.
///
/// Implementations must persist across process restarts (except test
/// backends) and must apply each [`WriteBatch`] atomically.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Returns every record in `ns`, in original insertion order.
    fn scan(
        &self,
        ns: Namespace,
    ) -> impl std::future::Future<Output = Result<Vec<(String, Vec<u8>)>, StoreError>> + Send;

    /// Returns one record.
    fn get(
        &self,
        ns: Namespace,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Applies a batch atomically.
    fn write_batch(
        &self,
        ns: Namespace,
        batch: WriteBatch,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Inserts or overwrites a single record.
    fn put(
        &self,
        ns: Namespace,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send {
        self.write_batch(ns, WriteBatch::new().put(key, value))
    }

    /// Removes a single record.
    fn delete(
        &self,
        ns: Namespace,
        key: impl Into<String>,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send {
        self.write_batch(ns, WriteBatch::new().delete(key))
    }
}
