use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::{KeyValueStore, MemoryStore, StoreError};

/// A [`MemoryStore`] that can be switched off or slowed down. For tests of
/// outage handling.
///
/// While unavailable every call fails with [`StoreError::Unavailable`] and
/// bumps [`FaultyStore::failures`].
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    down: AtomicBool,
    expire_down: AtomicBool,
    latency_ms: AtomicU64,
    failures: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.down.store(!available, Ordering::SeqCst);
    }

    /// Fail only `expire` calls, leaving the rest of the store up.
    pub fn set_expire_available(&self, available: bool) {
        self.expire_down.store(!available, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it touches the store.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of calls rejected so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    async fn check(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FaultyStore {
    async fn push(&self, list: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.check().await?;
        self.inner.push(list, value).await
    }

    async fn pop_blocking(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.check().await?;
        self.inner.pop_blocking(list, timeout).await
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        self.check().await?;
        self.inner.list_len(list).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check().await?;
        self.inner.get(key).await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check().await?;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check().await?;
        self.inner.delete(key).await
    }

    async fn increment_below(&self, key: &str, ceiling: i64) -> Result<Option<i64>, StoreError> {
        self.check().await?;
        self.inner.increment_below(key, ceiling).await
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        self.check().await?;
        self.inner.decrement(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check().await?;
        if self.expire_down.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected expire failure".to_string()));
        }
        self.inner.expire(key, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outage_rejects_and_counts() {
        let store = FaultyStore::new();
        store.set_available(false);
        assert!(store.get("k").await.is_err());
        assert!(store.push("q", vec![1]).await.is_err());
        assert_eq!(store.failures(), 2);

        store.set_available(true);
        store.push("q", vec![1]).await.unwrap();
        assert_eq!(store.list_len("q").await.unwrap(), 1);
    }
}
