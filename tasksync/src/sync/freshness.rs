//! Staleness policy for full resyncs.
//!
//! The time of the last successful full resync is kept in the `meta`
//! namespace so the policy survives restarts.

use std::time::Duration;

use tasksync_proto::codec;

use crate::store::{Namespace, Storage, StoreError};

/// Meta key holding the last full-sync time (ms since epoch).
const LAST_FULL_SYNC_KEY: &str = "last_full_sync";

/// Decides whether cached data is old enough to warrant a full resync.
pub trait Freshness: Send + Sync + 'static {
    /// `last_sync` is `None` when no full resync has ever completed.
    fn is_stale(&self, last_sync: Option<u64>, now_ms: u64) -> bool;
}

/// Stale once the last full resync is older than a fixed age.
#[derive(Debug, Clone, Copy)]
pub struct MaxAge(pub Duration);

impl Freshness for MaxAge {
    fn is_stale(&self, last_sync: Option<u64>, now_ms: u64) -> bool {
        let max_age = u64::try_from(self.0.as_millis()).unwrap_or(u64::MAX);
        last_sync.is_none_or(|at| now_ms.saturating_sub(at) >= max_age)
    }
}

/// Reads the last full-sync time.
///
/// An undecodable value is treated as "never synced".
///
/// # Errors
///
/// Returns [`StoreError`] if the storage read fails.
pub async fn last_full_sync<S: Storage>(storage: &S) -> Result<Option<u64>, StoreError> {
    let Some(bytes) = storage.get(Namespace::Meta, LAST_FULL_SYNC_KEY).await? else {
        return Ok(None);
    };
    match codec::decode::<u64>(&bytes) {
        Ok(at) => Ok(Some(at)),
        Err(err) => {
            tracing::warn!(error = %err, "ignoring undecodable last-sync marker");
            Ok(None)
        }
    }
}

/// Records a completed full resync.
///
/// # Errors
///
/// Returns [`StoreError`] if encoding or the durable write fails.
pub async fn record_full_sync<S: Storage>(storage: &S, at: u64) -> Result<(), StoreError> {
    let bytes = codec::encode(&at)?;
    storage.put(Namespace::Meta, LAST_FULL_SYNC_KEY, bytes).await
}
