use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{Collaborators, TaskHandler};
use crate::divination;
use crate::interpret::parse_reading;
use crate::persistence::Record;
use crate::prompts::build_divination_prompt;
use crate::queue::{Task, TaskKind};

/// Payload of a divination task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivinationRequest {
    pub question: String,
}

/// Casts for the question, asks for an interpretation and stores both.
pub struct DivinationHandler {
    deps: Arc<Collaborators>,
}

impl DivinationHandler {
    pub fn new(deps: Arc<Collaborators>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskHandler for DivinationHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Divination
    }

    async fn handle(&self, task: &Task, abort: &CancellationToken) -> Result<Value> {
        let request: DivinationRequest =
            serde_json::from_slice(&task.payload).context("invalid divination request")?;

        let cast = divination::generate(&request.question, self.deps.clock.now());
        tracing::debug!(task = %task.id, primary = %cast.primary_form, line = cast.line, "cast ready");

        let prompt = build_divination_prompt(&request.question, &cast);
        let raw = self
            .deps
            .complete(&prompt, abort)
            .await
            .context("interpretation service unavailable")?;

        let reading = parse_reading(&raw, &cast);
        let record = Record {
            task_id: task.id.clone(),
            kind: TaskKind::Divination,
            owner_hint: task.owner_hint.clone(),
            subject: request.question,
            primary_form: cast.primary_form.clone(),
            secondary_form: cast.secondary_form.clone(),
            changing_line: cast.changing_line.clone(),
            seed: cast.seed,
            raw_output: raw,
            final_output: serde_json::to_string(&reading).context("failed to encode reading")?,
            created_at: Utc::now(),
        };
        let id = self
            .deps
            .records
            .save(&record)
            .await
            .context("failed to save reading")?;

        Ok(json!({
            "divination_id": id,
            "hexagram": cast,
            "result": reading,
        }))
    }
}
