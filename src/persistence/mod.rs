pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::TaskKind;

/// The durable outcome of one processed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub task_id: String,
    pub kind: TaskKind,
    pub owner_hint: String,
    /// The question, or the story for a compatibility reading.
    pub subject: String,
    pub primary_form: String,
    pub secondary_form: String,
    pub changing_line: String,
    pub seed: i64,
    /// Reply exactly as the generative service sent it.
    pub raw_output: String,
    /// The post-processed payload, as JSON text.
    pub final_output: String,
    pub created_at: DateTime<Utc>,
}

/// Where finished readings go. A failed save fails the task.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Store a record and return its id.
    async fn save(&self, record: &Record) -> Result<i64>;
    async fn get(&self, id: i64) -> Result<Option<Record>>;
}
