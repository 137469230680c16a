//! Durable persistence of utilization records
//!
//! The record sink writes one JSON row per node per run into an object store,
//! under keys partitioned by account, region, run date and run id.

mod record_sink;
mod store;

pub use record_sink::{RecordSink, SinkConfig, StoredRow, WriteOutcome, WriteResult, SCHEMA_VERSION};
pub use store::{LocalObjectStore, MemoryObjectStore};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("object store unavailable: {0}")]
    Unavailable(String),

    #[error("object store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bulk object storage with overwrite-on-put semantics
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// `None` when the key does not exist
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Keys starting with `prefix`, sorted
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Keys are `/`-separated relative paths without empty or dot segments
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && !key.contains('\\')
        && key
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}
