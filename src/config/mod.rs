//! Command-line and environment configuration.
//!
//! Every knob can be set by flag or environment variable (a `.env` file is
//! loaded first). [`CliArgs`] is the raw parse; [`PipelineConfig`] is the
//! validated form the rest of the crate consumes.

use anyhow::{Context, bail};
use chrono::{FixedOffset, Offset, Utc};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;

use crate::consts::{
    DEFAULT_COUNTER_TTL, DEFAULT_DAILY_QUOTA, DEFAULT_DEQUEUE_BACKOFF, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_MAX_TEXT_CHARS, DEFAULT_MODEL, DEFAULT_OUTBOUND_TIMEOUT, DEFAULT_RATE_PER_SEC,
    DEFAULT_RELEASE_DEADLINE, DEFAULT_STATUS_TTL, DEFAULT_UTC_OFFSET_HOURS, DEFAULT_WORKERS,
    default_db_path,
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "fromheart",
    version,
    about = "Queue-backed divination readings, paced for a rate-limited model."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// SQLite database holding the queue, statuses and readings
    /// (use :memory: for ephemeral)
    #[arg(long, global = true, env = "FROMHEART_DB")]
    pub db: Option<String>,

    /// Number of worker loops
    #[arg(long, global = true, env = "FROMHEART_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Aggregate generative calls per second across all workers
    #[arg(long, global = true, env = "FROMHEART_RATE", default_value_t = DEFAULT_RATE_PER_SEC)]
    pub rate: u32,

    /// Heavy requests allowed in flight at once
    #[arg(long, global = true, env = "FROMHEART_MAX_CONCURRENCY", default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub max_concurrency: u32,

    /// Requests per caller per day (0 disables the quota)
    #[arg(long, global = true, env = "FROMHEART_DAILY_QUOTA", default_value_t = DEFAULT_DAILY_QUOTA)]
    pub daily_quota: u32,

    /// Seconds a task status survives after its last update
    #[arg(long, global = true, env = "FROMHEART_STATUS_TTL_SECS", default_value_t = DEFAULT_STATUS_TTL.as_secs())]
    pub status_ttl_secs: u64,

    /// Hours east of UTC used for the casting calendar
    #[arg(long, global = true, env = "FROMHEART_UTC_OFFSET", default_value_t = DEFAULT_UTC_OFFSET_HOURS, allow_hyphen_values = true)]
    pub utc_offset: i32,

    /// Chat completions base URL
    #[arg(long, global = true, env = "LLM_BASE_URL")]
    pub llm_base_url: Option<String>,

    /// Model name sent with every completion request
    #[arg(long, global = true, env = "LLM_MODEL", default_value = DEFAULT_MODEL)]
    pub llm_model: String,

    #[arg(long, global = true, env = "LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// Upper bound on one generative call, in seconds
    #[arg(long, global = true, env = "LLM_TIMEOUT_SECS", default_value_t = DEFAULT_OUTBOUND_TIMEOUT.as_secs())]
    pub llm_timeout_secs: u64,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the worker pool until Ctrl+C
    Work {
        /// Seconds to let in-flight tasks finish on shutdown
        #[arg(long, default_value_t = 10)]
        grace_secs: u64,
    },
    /// Submit a request and print its task id
    Submit {
        /// Caller identity used for the daily quota
        #[arg(long, env = "FROMHEART_OWNER", default_value = "anonymous")]
        owner: String,

        #[command(subcommand)]
        request: SubmitRequest,
    },
    /// Print the status of a task
    Poll { task_id: String },
    /// Cast for some text at the current time and print the hexagrams
    Cast { text: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubmitRequest {
    /// Ask a question
    Divination { question: String },
    /// Read two people's compatibility
    Compatibility(CompatibilityArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CompatibilityArgs {
    #[arg(long)]
    pub name_a: String,
    #[arg(long, default_value = "")]
    pub gender_a: String,
    #[arg(long, default_value = "")]
    pub birth_a: String,
    #[arg(long)]
    pub name_b: String,
    #[arg(long, default_value = "")]
    pub gender_b: String,
    #[arg(long, default_value = "")]
    pub birth_b: String,
    #[arg(long, default_value = "")]
    pub story: String,
}

/// Validated runtime settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: String,
    pub workers: usize,
    pub rate_per_sec: u32,
    pub max_concurrency: u32,
    pub daily_quota: u32,
    pub max_text_chars: usize,
    pub status_ttl: Duration,
    pub counter_ttl: Duration,
    pub release_deadline: Duration,
    pub outbound_timeout: Duration,
    pub dequeue_backoff: Duration,
    pub utc_offset: FixedOffset,
    pub llm_base_url: Option<String>,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path().to_string_lossy().into_owned(),
            workers: DEFAULT_WORKERS,
            rate_per_sec: DEFAULT_RATE_PER_SEC,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            daily_quota: DEFAULT_DAILY_QUOTA,
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
            status_ttl: DEFAULT_STATUS_TTL,
            counter_ttl: DEFAULT_COUNTER_TTL,
            release_deadline: DEFAULT_RELEASE_DEADLINE,
            outbound_timeout: DEFAULT_OUTBOUND_TIMEOUT,
            dequeue_backoff: DEFAULT_DEQUEUE_BACKOFF,
            utc_offset: FixedOffset::east_opt(DEFAULT_UTC_OFFSET_HOURS * 3600)
                .unwrap_or_else(|| Utc.fix()),
            llm_base_url: None,
            llm_model: DEFAULT_MODEL.to_string(),
            llm_api_key: None,
        }
    }
}

fn utc_offset(hours: i32) -> anyhow::Result<FixedOffset> {
    if !(-12..=14).contains(&hours) {
        bail!("UTC offset must be between -12 and +14 hours, got {hours}");
    }
    FixedOffset::east_opt(hours * 3600).context("invalid UTC offset")
}

impl TryFrom<&CliArgs> for PipelineConfig {
    type Error = anyhow::Error;

    fn try_from(args: &CliArgs) -> Result<Self, Self::Error> {
        if args.workers == 0 {
            bail!("FROMHEART_WORKERS must be greater than 0");
        }
        if args.max_concurrency == 0 {
            bail!("FROMHEART_MAX_CONCURRENCY must be greater than 0");
        }
        if args.status_ttl_secs == 0 {
            bail!("FROMHEART_STATUS_TTL_SECS must be greater than 0");
        }
        if args.llm_timeout_secs == 0 {
            bail!("LLM_TIMEOUT_SECS must be greater than 0");
        }
        if args.llm_model.trim().is_empty() {
            bail!("LLM_MODEL must not be empty");
        }
        if args.rate == 0 {
            tracing::warn!("FROMHEART_RATE is 0, outbound calls will stall");
        }

        let defaults = Self::default();
        Ok(Self {
            db_path: args.db.clone().unwrap_or(defaults.db_path),
            workers: args.workers,
            rate_per_sec: args.rate,
            max_concurrency: args.max_concurrency,
            daily_quota: args.daily_quota,
            status_ttl: Duration::from_secs(args.status_ttl_secs),
            outbound_timeout: Duration::from_secs(args.llm_timeout_secs),
            utc_offset: utc_offset(args.utc_offset)?,
            llm_base_url: args.llm_base_url.clone(),
            llm_model: args.llm_model.clone(),
            llm_api_key: args.llm_api_key.clone(),
            ..defaults
        })
    }
}
