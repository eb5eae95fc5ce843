use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{PersistenceStore, Record};
use crate::queue::TaskKind;

/// SQLite-backed reading history.
pub struct SqliteRecords {
    conn: Mutex<Connection>,
}

impl SqliteRecords {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open records database")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS readings (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id        TEXT NOT NULL,
                kind           TEXT NOT NULL,
                owner_hint     TEXT NOT NULL,
                subject        TEXT NOT NULL,
                primary_form   TEXT NOT NULL,
                secondary_form TEXT NOT NULL,
                changing_line  TEXT NOT NULL,
                seed           INTEGER NOT NULL,
                raw_output     TEXT NOT NULL,
                final_output   TEXT NOT NULL,
                created_at     TEXT NOT NULL
            )",
        )
        .context("failed to create readings table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("records connection lock poisoned"))
    }
}

fn kind_to_str(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Divination => "divination",
        TaskKind::Compatibility => "compatibility",
    }
}

fn kind_from_str(s: &str) -> Result<TaskKind> {
    match s {
        "divination" => Ok(TaskKind::Divination),
        "compatibility" => Ok(TaskKind::Compatibility),
        other => Err(anyhow!("unknown record kind: {other}")),
    }
}

#[async_trait]
impl PersistenceStore for SqliteRecords {
    async fn save(&self, record: &Record) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO readings (
                task_id, kind, owner_hint, subject, primary_form, secondary_form,
                changing_line, seed, raw_output, final_output, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.task_id,
                kind_to_str(record.kind),
                record.owner_hint,
                record.subject,
                record.primary_form,
                record.secondary_form,
                record.changing_line,
                record.seed,
                record.raw_output,
                record.final_output,
                record.created_at.to_rfc3339(),
            ],
        )
        .context("failed to insert reading")?;
        Ok(conn.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> Result<Option<Record>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT task_id, kind, owner_hint, subject, primary_form, secondary_form,
                        changing_line, seed, raw_output, final_output, created_at
                 FROM readings WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            task_id,
            kind,
            owner_hint,
            subject,
            primary_form,
            secondary_form,
            changing_line,
            seed,
            raw_output,
            final_output,
            created_at,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(Record {
            task_id,
            kind: kind_from_str(&kind)?,
            owner_hint,
            subject,
            primary_form,
            secondary_form,
            changing_line,
            seed,
            raw_output,
            final_output,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .context("bad created_at in readings")?
                .with_timezone(&Utc),
        }))
    }
}
