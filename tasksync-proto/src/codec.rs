//! Record encoding for durable storage.
//!
//! Queue records and cached entities are stored as postcard bytes. The
//! encoding is versioned by a single leading byte so a future layout change
//! can be detected instead of misread.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Current record layout version.
pub const RECORD_VERSION: u8 = 1;

/// Error type for record encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The record is empty or was written by an unknown layout version.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Encodes a value as a versioned record.
///
/// Wire format: `[u8 version][postcard payload]`
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let payload =
        postcard::to_allocvec(value).map_err(|e| CodecError::Serialization(e.to_string()))?;
    let mut record = Vec::with_capacity(1 + payload.len());
    record.push(RECORD_VERSION);
    record.extend_from_slice(&payload);
    Ok(record)
}

/// Decodes a versioned record.
///
/// # Errors
///
/// Returns `CodecError::InvalidRecord` for an empty record or an unknown
/// version, or `CodecError::Serialization` if the payload does not decode
/// (for example an action kind this build does not know).
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let Some((&version, payload)) = bytes.split_first() else {
        return Err(CodecError::InvalidRecord("empty record".into()));
    };
    if version != RECORD_VERSION {
        return Err(CodecError::InvalidRecord(format!(
            "unsupported record version {version}"
        )));
    }
    postcard::from_bytes(payload).map_err(|e| CodecError::Serialization(e.to_string()))
}
