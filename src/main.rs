use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use fromheart::PipelineError;
use fromheart::admission::{AdmissionGate, Weight};
use fromheart::config::{CliArgs, Command, CompatibilityArgs, PipelineConfig, SubmitRequest};
use fromheart::divination::{self, Clock, SystemClock};
use fromheart::generative::http::ChatCompletionsClient;
use fromheart::persistence::sqlite::SqliteRecords;
use fromheart::producer::Producer;
use fromheart::queue::WorkQueue;
use fromheart::store::{KeyValueStore, SqliteStore};
use fromheart::telemetry;
use fromheart::throttle::OutboundThrottle;
use fromheart::worker::compatibility::CompatibilityRequest;
use fromheart::worker::divination::DivinationRequest;
use fromheart::worker::{
    Collaborators, CompatibilityHandler, DivinationHandler, HandlerRegistry, WorkerPool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();
    telemetry::init();

    let args = CliArgs::parse();
    let config = PipelineConfig::try_from(&args)?;

    match args.command {
        Command::Work { grace_secs } => work(&config, Duration::from_secs(grace_secs)).await,
        Command::Submit { owner, request } => submit(&config, &owner, request).await,
        Command::Poll { task_id } => poll(&config, &task_id).await,
        Command::Cast { text } => cast(&config, &text),
    }
}

fn open_store(config: &PipelineConfig) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    if config.db_path != ":memory:" {
        if let Some(dir) = Path::new(&config.db_path).parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
    }
    let store = SqliteStore::open(&config.db_path).context("failed to open task store")?;
    Ok(Arc::new(store))
}

fn open_queue(config: &PipelineConfig, store: Arc<dyn KeyValueStore>) -> Arc<WorkQueue> {
    Arc::new(WorkQueue::new(store).with_status_ttl(config.status_ttl))
}

async fn work(config: &PipelineConfig, grace: Duration) -> anyhow::Result<()> {
    let queue = open_queue(config, open_store(config)?);
    let records = Arc::new(SqliteRecords::open(&config.db_path)?);

    if config.llm_api_key.is_none() {
        tracing::warn!("LLM_API_KEY is not set; every task will fail until it is");
    }
    let client = Arc::new(ChatCompletionsClient::new(
        config.llm_base_url.clone(),
        config.llm_model.clone(),
        config.llm_api_key.clone(),
        config.outbound_timeout,
    )?);

    let deps = Arc::new(
        Collaborators::new(
            Arc::new(SystemClock::new(config.utc_offset)),
            Arc::new(OutboundThrottle::new(config.rate_per_sec)),
            client,
            records,
        )
        .with_call_timeout(config.outbound_timeout),
    );
    let handlers = HandlerRegistry::new()
        .with(Arc::new(DivinationHandler::new(Arc::clone(&deps))))
        .with(Arc::new(CompatibilityHandler::new(deps)));

    let pool = WorkerPool::new(queue, handlers).with_backoff(config.dequeue_backoff);
    let handle = pool.start(config.workers);
    tracing::info!(db = %config.db_path, "waiting for tasks, Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    handle.shutdown(grace).await;
    Ok(())
}

async fn submit(config: &PipelineConfig, owner: &str, request: SubmitRequest) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let gate = AdmissionGate::new(Arc::clone(&store), config.max_concurrency)
        .with_counter_ttl(config.counter_ttl)
        .with_release_deadline(config.release_deadline);
    let producer = Producer::new(
        open_queue(config, store),
        OutboundThrottle::period_for(config.rate_per_sec),
    )
    .with_clock(Arc::new(SystemClock::new(config.utc_offset)))
    .with_daily_quota(config.daily_quota)
    .with_max_text_chars(config.max_text_chars);

    let submission = gate
        .run(Weight::Heavy, async {
            match request {
                SubmitRequest::Divination { question } => {
                    producer
                        .submit_divination(&DivinationRequest { question }, owner)
                        .await
                }
                SubmitRequest::Compatibility(args) => {
                    producer
                        .submit_compatibility(&compatibility_request(args), owner)
                        .await
                }
            }
        })
        .await
        .map_err(explain)?;

    println!("{}", serde_json::to_string_pretty(&submission)?);
    Ok(())
}

/// Tell the user when trying again later is the fix.
fn explain(e: PipelineError) -> anyhow::Error {
    if e.is_transient() {
        anyhow::Error::new(e).context("temporary failure, try again shortly")
    } else {
        e.into()
    }
}

fn compatibility_request(args: CompatibilityArgs) -> CompatibilityRequest {
    CompatibilityRequest {
        name_a: args.name_a,
        gender_a: args.gender_a,
        birth_date_a: args.birth_a,
        name_b: args.name_b,
        gender_b: args.gender_b,
        birth_date_b: args.birth_b,
        story: args.story,
    }
}

async fn poll(config: &PipelineConfig, task_id: &str) -> anyhow::Result<()> {
    let producer = Producer::new(
        open_queue(config, open_store(config)?),
        OutboundThrottle::period_for(config.rate_per_sec),
    );
    let status = producer.poll(task_id).await.map_err(explain)?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn cast(config: &PipelineConfig, text: &str) -> anyhow::Result<()> {
    let now = SystemClock::new(config.utc_offset).now();
    let result = divination::generate(text, now);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
