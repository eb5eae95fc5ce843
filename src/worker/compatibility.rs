use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{Collaborators, TaskHandler};
use crate::divination;
use crate::interpret::parse_compatibility;
use crate::persistence::Record;
use crate::prompts::build_compatibility_prompt;
use crate::queue::{Task, TaskKind};

/// Payload of a compatibility task. The story is what gets cast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityRequest {
    pub name_a: String,
    #[serde(default)]
    pub gender_a: String,
    #[serde(default)]
    pub birth_date_a: String,
    pub name_b: String,
    #[serde(default)]
    pub gender_b: String,
    #[serde(default)]
    pub birth_date_b: String,
    #[serde(default)]
    pub story: String,
}

pub struct CompatibilityHandler {
    deps: Arc<Collaborators>,
}

impl CompatibilityHandler {
    pub fn new(deps: Arc<Collaborators>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskHandler for CompatibilityHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Compatibility
    }

    async fn handle(&self, task: &Task, abort: &CancellationToken) -> Result<Value> {
        let request: CompatibilityRequest =
            serde_json::from_slice(&task.payload).context("invalid compatibility request")?;

        let cast = divination::generate(&request.story, self.deps.clock.now());
        let prompt = build_compatibility_prompt(&request, &cast);
        let raw = self
            .deps
            .complete(&prompt, abort)
            .await
            .context("analysis service unavailable")?;

        let (analysis, degraded) = parse_compatibility(&raw);
        if degraded {
            tracing::info!(task = %task.id, "serving canned compatibility analysis");
        }

        let record = Record {
            task_id: task.id.clone(),
            kind: TaskKind::Compatibility,
            owner_hint: task.owner_hint.clone(),
            subject: request.story,
            primary_form: cast.primary_form.clone(),
            secondary_form: cast.secondary_form.clone(),
            changing_line: cast.changing_line.clone(),
            seed: cast.seed,
            raw_output: raw,
            final_output: analysis.to_string(),
            created_at: Utc::now(),
        };
        let id = self
            .deps
            .records
            .save(&record)
            .await
            .context("failed to save analysis")?;

        Ok(json!({
            "id": id,
            "analysis": analysis,
            "degraded": degraded,
            "hexagram": cast,
        }))
    }
}
