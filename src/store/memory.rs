use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{KeyValueStore, StoreError, parse_counter};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct State {
    values: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
}

impl State {
    /// Live entry at `key`; drops it on the way if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.values.get(key).is_some_and(|e| !e.is_live(now)) {
            self.values.remove(key);
        }
        self.values.get_mut(key)
    }

    /// Drop every expired entry. Called on each keyed write.
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.values.retain(|_, e| e.is_live(now));
    }
}

/// In-process store. Expiry follows tokio's clock, so paused-time tests can
/// jump past a TTL.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn try_pop(&self, list: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.state()?.lists.get_mut(list).and_then(|l| l.pop_back()))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn push(&self, list: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.state()?
            .lists
            .entry(list.to_string())
            .or_default()
            .push_front(value);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop_blocking(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the await still wakes us.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(list)? {
                return Ok(Some(value));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.try_pop(list);
                }
            }
        }
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        Ok(self.state()?.lists.get(list).map_or(0, VecDeque::len))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.state()?.live(key).map(|e| e.value.clone()))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.purge_expired();
        state.values.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.state()?.values.remove(key);
        Ok(())
    }

    async fn increment_below(&self, key: &str, ceiling: i64) -> Result<Option<i64>, StoreError> {
        let mut state = self.state()?;
        state.purge_expired();
        let (current, expires_at) = match state.live(key) {
            Some(entry) => (parse_counter(key, &entry.value)?, entry.expires_at),
            None => (0, None),
        };
        if current >= ceiling {
            return Ok(None);
        }
        let next = current + 1;
        state.values.insert(
            key.to_string(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(Some(next))
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        let mut state = self.state()?;
        match state.live(key) {
            Some(entry) => {
                let next = (parse_counter(key, &entry.value)? - 1).max(0);
                entry.value = next.to_string().into_bytes();
                Ok(next)
            }
            None => Ok(0),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        match self.state()?.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn list_is_fifo() {
        let store = MemoryStore::new();
        store.push("q", b"a".to_vec()).await.unwrap();
        store.push("q", b"b".to_vec()).await.unwrap();
        assert_eq!(store.list_len("q").await.unwrap(), 2);

        let first = store.pop_blocking("q", Duration::ZERO).await.unwrap();
        let second = store.pop_blocking("q", Duration::ZERO).await.unwrap();
        assert_eq!(first.as_deref(), Some(&b"a"[..]));
        assert_eq!(second.as_deref(), Some(&b"b"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_times_out_on_empty_list() {
        let store = MemoryStore::new();
        let got = store
            .pop_blocking("q", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn blocked_pop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.pop_blocking("q", Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        store.push("q", b"job".to_vec()).await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some(&b"job"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn writes_purge_expired_entries() {
        let store = MemoryStore::new();
        for n in 0..50 {
            store
                .set_with_ttl(&format!("s{n}"), b"v".to_vec(), Duration::from_secs(1))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        store
            .set_with_ttl("fresh", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.state().unwrap().values.len(), 1);

        store.increment_below("c", 5).await.unwrap();
        assert_eq!(store.state().unwrap().values.len(), 2);
    }

    #[tokio::test]
    async fn increment_stops_at_ceiling() {
        let store = MemoryStore::new();
        assert_eq!(store.increment_below("c", 2).await.unwrap(), Some(1));
        assert_eq!(store.increment_below("c", 2).await.unwrap(), Some(2));
        assert_eq!(store.increment_below("c", 2).await.unwrap(), None);
        assert_eq!(store.get("c").await.unwrap().as_deref(), Some(&b"2"[..]));
    }

    #[tokio::test]
    async fn decrement_never_goes_negative() {
        let store = MemoryStore::new();
        assert_eq!(store.decrement("c").await.unwrap(), 0);
        store.increment_below("c", 5).await.unwrap();
        assert_eq!(store.decrement("c").await.unwrap(), 0);
        assert_eq!(store.decrement("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn increment_rejects_non_numeric_value() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("c", b"nope".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        let err = store.increment_below("c", 5).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_applies_to_counters() {
        let store = MemoryStore::new();
        assert!(!store.expire("c", Duration::from_secs(1)).await.unwrap());
        store.increment_below("c", 5).await.unwrap();
        assert!(store.expire("c", Duration::from_secs(1)).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("c").await.unwrap().is_none());
        assert_eq!(store.increment_below("c", 5).await.unwrap(), Some(1));
    }
}
