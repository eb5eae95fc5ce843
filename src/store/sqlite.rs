use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{KeyValueStore, StoreError, parse_counter};

/// Interval between attempts while a blocking pop waits on an empty list.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// SQLite-backed durable store.
///
/// Shares a database file with
/// [`SqliteRecords`](crate::persistence::sqlite::SqliteRecords); pass the
/// same path to both. Several processes may open the same file: pops and
/// counter updates run in immediate transactions, so the write lock makes
/// them atomic across connections.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                expires_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS kv_list (
                id    INTEGER PRIMARY KEY AUTOINCREMENT,
                list  TEXT NOT NULL,
                value BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS kv_list_by_list ON kv_list (list, id);
            CREATE INDEX IF NOT EXISTS kv_by_expiry ON kv (expires_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))
    }

    fn try_pop(&self, list: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let oldest: Option<(i64, Vec<u8>)> = tx
            .query_row(
                "SELECT id, value FROM kv_list WHERE list = ?1 ORDER BY id ASC LIMIT 1",
                [list],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((id, _)) = &oldest {
            tx.execute("DELETE FROM kv_list WHERE id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(oldest.map(|(_, value)| value))
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry(ttl: Duration) -> i64 {
    now_millis() + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2)
}

/// Live value and expiry at `key` inside an open connection or transaction.
fn live_value(conn: &Connection, key: &str) -> Result<Option<(Vec<u8>, Option<i64>)>, StoreError> {
    let row = conn
        .query_row(
            "SELECT value, expires_at FROM kv
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![key, now_millis()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row)
}

/// Delete every key whose TTL has passed. Runs before each keyed write so
/// abandoned statuses and old quota counters don't pile up.
fn purge_expired(conn: &Connection) -> Result<usize, StoreError> {
    let removed = conn.execute(
        "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        [now_millis()],
    )?;
    Ok(removed)
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn push(&self, list: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv_list (list, value) VALUES (?1, ?2)",
            params![list, value],
        )?;
        Ok(())
    }

    async fn pop_blocking(
        &self,
        list: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(value) = self.try_pop(list)? {
                return Ok(Some(value));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn list_len(&self, list: &str) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv_list WHERE list = ?1",
            [list],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn()?;
        Ok(live_value(&conn, key)?.map(|(value, _)| value))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        purge_expired(&conn)?;
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expiry(ttl)],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    async fn increment_below(&self, key: &str, ceiling: i64) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        purge_expired(&tx)?;
        let (current, expires_at) = match live_value(&tx, key)? {
            Some((value, expires_at)) => (parse_counter(key, &value)?, expires_at),
            None => (0, None),
        };
        if current >= ceiling {
            return Ok(None);
        }
        let next = current + 1;
        tx.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, next.to_string().into_bytes(), expires_at],
        )?;
        tx.commit()?;
        Ok(Some(next))
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some((value, _)) = live_value(&tx, key)? else {
            return Ok(0);
        };
        let next = (parse_counter(key, &value)? - 1).max(0);
        tx.execute(
            "UPDATE kv SET value = ?2 WHERE key = ?1",
            params![key, next.to_string().into_bytes()],
        )?;
        tx.commit()?;
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE kv SET expires_at = ?2
             WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?3)",
            params![key, expiry(ttl), now_millis()],
        )?;
        Ok(changed > 0)
    }
}
