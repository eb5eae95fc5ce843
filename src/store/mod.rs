pub mod faulty;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use faulty::FaultyStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A value exists but is not what the operation expects (e.g. a
    /// non-numeric counter).
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// The primitives the queue, the admission gate and the quota check need.
///
/// Every method is atomic on its own. Callers never lock around a sequence of
/// calls; anything that must be atomic as a whole is a single method here
/// (see [`KeyValueStore::increment_below`]).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Append to the head of a list. [`KeyValueStore::pop_blocking`] takes
    /// from the tail, so a list behaves as a FIFO.
    async fn push(&self, list: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove and return the oldest element, waiting up to `timeout` for one
    /// to arrive. Each element is handed to exactly one caller.
    async fn pop_blocking(&self, list: &str, timeout: Duration)
    -> Result<Option<Vec<u8>>, StoreError>;

    async fn list_len(&self, list: &str) -> Result<usize, StoreError>;

    /// Value at `key`, or `None` if missing or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Unconditional overwrite with a fresh expiry.
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration)
    -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically increment the counter at `key` if it is below `ceiling`.
    /// Returns the new value, or `None` when the counter is already at or
    /// above the ceiling (nothing is written). A missing key counts as 0.
    async fn increment_below(&self, key: &str, ceiling: i64) -> Result<Option<i64>, StoreError>;

    /// Decrement the counter at `key`, never going below zero.
    async fn decrement(&self, key: &str) -> Result<i64, StoreError>;

    /// Set the expiry of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}

pub(crate) fn parse_counter(key: &str, bytes: &[u8]) -> Result<i64, StoreError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| StoreError::Corrupt {
            key: key.to_string(),
            reason: "counter is not an integer".to_string(),
        })
}
