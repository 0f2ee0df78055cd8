//! Worker process entrypoint (SPEC_FULL §13).
//!
//! Loads [`Settings`], installs `tracing-subscriber`, opens the
//! `sqlx::PgPool`, constructs the [`Orchestrator`], and either runs the
//! long-running job-consumption loop or a one-shot operational subcommand.

use std::sync::Arc;
use std::time::Duration;

use affiliate_feed_core::config::Settings;
use affiliate_feed_core::fetcher::FetcherPolicy;
use affiliate_feed_core::models::{IngestJob, RunTrigger};
use affiliate_feed_core::notify::Notifier;
use affiliate_feed_core::orchestrator::Orchestrator;
use affiliate_feed_core::processor::ProcessorConfig;
use affiliate_feed_core::store::postgres::PgFeedStore;
use affiliate_feed_core::store::FeedStore;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "affiliate-feed-worker", version, about = "Affiliate feed ingestion worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the long-running job-consumption loop (the default).
    Worker,
    /// Enqueue one manual run for a single feed and wait for it to finish.
    Run {
        #[arg(long)]
        feed_id: Uuid,
        #[arg(long, value_enum, default_value_t = CliTrigger::Manual)]
        trigger: CliTrigger,
    },
    /// Apply the SQL schema under `migrations/`.
    Migrate,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliTrigger {
    Manual,
    AdminTest,
    Retry,
}

impl From<CliTrigger> for RunTrigger {
    fn from(value: CliTrigger) -> Self {
        match value {
            CliTrigger::Manual => RunTrigger::Manual,
            CliTrigger::AdminTest => RunTrigger::AdminTest,
            CliTrigger::Retry => RunTrigger::Retry,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::load().context("failed to load settings")?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.worker_pool_size as u32 + 2)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to database")?;

    match cli.command.unwrap_or(Command::Worker) {
        Command::Migrate => run_migrate(&pool).await,
        Command::Run { feed_id, trigger } => run_one(pool, settings, feed_id, trigger.into()).await,
        Command::Worker => run_worker_loop(pool, settings).await,
    }
}

async fn run_migrate(pool: &sqlx::PgPool) -> Result<()> {
    info!("applying migrations");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("migration failed")?;
    info!("migrations applied");
    Ok(())
}

fn build_orchestrator(
    pool: sqlx::PgPool,
    settings: &Settings,
) -> Orchestrator<PgFeedStore> {
    let store = Arc::new(PgFeedStore::new(pool.clone()));
    let notifier = Notifier::new(settings.notifications.clone());
    let fetcher_policy = FetcherPolicy {
        allow_plain_ftp: settings.allow_plain_ftp,
        sftp_ready_timeout_secs: settings.sftp_ready_timeout_secs,
    };
    let processor_config = ProcessorConfig {
        chunk_size: settings.chunk_size,
        heartbeat_hours: settings.heartbeat_hours,
        ..ProcessorConfig::default()
    };

    Orchestrator::new(
        store,
        pool,
        notifier,
        settings.worker_pool_size,
        settings.job_rate_limit_per_minute,
        fetcher_policy,
        processor_config,
    )
}

/// `run --feed-id <id> --trigger manual`: enqueue one job for the feed and
/// drive it to completion in-process, printing the outcome.
async fn run_one(
    pool: sqlx::PgPool,
    settings: Settings,
    feed_id: Uuid,
    trigger: RunTrigger,
) -> Result<()> {
    let orchestrator = build_orchestrator(pool, &settings);
    let job = IngestJob::new(feed_id, trigger);
    let outcome = orchestrator
        .process(job)
        .await
        .context("run failed")?;
    info!(?outcome, feed_id = %feed_id, "manual run finished");
    Ok(())
}

/// The long-running loop: periodically enqueue due feeds, continuously
/// claim and drive jobs, until Ctrl-C, draining in-flight work before exit.
async fn run_worker_loop(pool: sqlx::PgPool, settings: Settings) -> Result<()> {
    let store = Arc::new(PgFeedStore::new(pool.clone()));
    let orchestrator = Arc::new(build_orchestrator(pool, &settings));

    let scheduler_store = store.clone();
    let scheduler = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            match scheduler_store.due_feeds(chrono::Utc::now()).await {
                Ok(feeds) => {
                    for feed in feeds {
                        let job = IngestJob::new(feed.id, RunTrigger::Scheduled);
                        if let Err(err) = scheduler_store.enqueue_ingest_job(&job).await {
                            warn!(feed_id = %feed.id, error = %err, "failed to enqueue scheduled job");
                        }
                    }
                }
                Err(err) => warn!(error = %err, "failed to poll due feeds"),
            }
        }
    });

    let mut in_flight = tokio::task::JoinSet::new();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("worker started");
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested, draining in-flight jobs");
                break;
            }
            jobs = store.claim_ingest_jobs(settings.worker_pool_size as i64) => {
                match jobs {
                    Ok(jobs) if !jobs.is_empty() => {
                        for job in jobs {
                            let orchestrator = orchestrator.clone();
                            in_flight.spawn(async move {
                                if let Err(err) = orchestrator.process(job).await {
                                    warn!(error = %err, "job failed");
                                }
                            });
                        }
                    }
                    Ok(_) => tokio::time::sleep(Duration::from_millis(500)).await,
                    Err(err) => {
                        warn!(error = %err, "failed to claim jobs");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    scheduler.abort();
    while in_flight.join_next().await.is_some() {}
    info!("worker stopped");
    Ok(())
}
