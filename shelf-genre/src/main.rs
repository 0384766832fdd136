//! shelf-genre - book genre enrichment
//!
//! Subcommands map onto the workflow stages, which can run as separate
//! processes against one database:
//! - `submit`: create a job and publish its work
//! - `work`: run the worker pool
//! - `aggregate`: scan for finished jobs and write reports
//! - `status` / `report`: read job state
//! - `run`: all of the above in one process for one job

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shelf_common::config::{locate_config_file, prepare_root_folder, resolve_root_folder};
use shelf_common::events::{EnrichEvent, EventBus};
use shelf_genre::config::{EnrichConfig, SERVICE_NAME};
use shelf_genre::db::{open_database, Stores};
use shelf_genre::models::BookIdentity;
use shelf_genre::workflow::{load_report, Aggregator, ScanOutcome, WorkDistributor, Worker, WorkerPool};
use shelf_genre::BookEnricher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "shelf-genre", version, about = "Book genre enrichment")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "SHELF_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder holding the database
    #[arg(long, global = true)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a job from a JSON array of books and publish its work
    Submit {
        #[arg(long)]
        books: PathBuf,
    },
    /// Run the worker pool
    Work {
        /// Exit once the queue is empty
        #[arg(long)]
        drain: bool,
    },
    /// Scan processing jobs once, or keep scanning with --watch
    Aggregate {
        #[arg(long)]
        watch: bool,
    },
    /// Print a job status record
    Status { job_id: Uuid },
    /// Print a job's final report
    Report { job_id: Uuid },
    /// Submit, enrich and aggregate one job in this process
    Run {
        #[arg(long)]
        books: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shelf_genre=info,shelf_common=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let root = resolve_root_folder(cli.root_folder.as_deref());
    let db_path = prepare_root_folder(&root)?;
    let config_path = locate_config_file(cli.config.as_deref(), &root, SERVICE_NAME);
    let config = EnrichConfig::load(config_path.as_deref())?;

    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));
    info!("Database: {}", db_path.display());

    let max_connections = (config.worker.concurrency as u32 + 4).max(5);
    let pool = open_database(&db_path, max_connections).await?;
    let stores = Stores::sqlite(pool);
    let events = EventBus::new(1024);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    match cli.command {
        Command::Submit { books } => {
            let books = read_books(&books)?;
            let distributor =
                WorkDistributor::new(stores, config.distributor.clone(), events.clone());
            let job = distributor.submit(books).await?;
            println!("{}", job.job_id);
        }
        Command::Work { drain } => {
            let pool = worker_pool(&config, stores, events.clone())?;
            tokio::spawn(log_events(events.clone(), cancel.clone()));
            pool.run(cancel, drain).await;
        }
        Command::Aggregate { watch } => {
            let aggregator = Aggregator::new(stores, config.aggregator.clone(), events);
            if watch {
                aggregator.run(cancel).await;
            } else {
                for (job_id, outcome) in aggregator.scan_once().await? {
                    info!(job_id = %job_id, outcome = ?outcome, "Scanned job");
                }
            }
        }
        Command::Status { job_id } => {
            let Some(job) = stores.jobs.get(job_id).await? else {
                bail!("Unknown job {}", job_id);
            };
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::Report { job_id } => {
            let Some(report) = load_report(&stores, job_id).await? else {
                bail!("No report for job {} (not complete yet?)", job_id);
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Run { books } => {
            let books = read_books(&books)?;
            run_job(&config, stores, events, books, cancel).await?;
        }
    }

    Ok(())
}

/// Submit one job and drive it to a terminal status in-process
async fn run_job(
    config: &EnrichConfig,
    stores: Stores,
    events: EventBus,
    books: Vec<BookIdentity>,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::spawn(log_events(events.clone(), cancel.clone()));

    let distributor =
        WorkDistributor::new(stores.clone(), config.distributor.clone(), events.clone());
    let job = distributor.submit(books).await?;
    info!(job_id = %job.job_id, total_items = job.total_items, "Job submitted");

    let pool = worker_pool(config, stores.clone(), events.clone())?;
    let workers_done = CancellationToken::new();
    let workers = {
        let token = cancel.child_token();
        let done = workers_done.clone();
        tokio::spawn(async move {
            let stats = pool.run(token, true).await;
            done.cancel();
            stats
        })
    };

    let aggregator = Aggregator::new(stores.clone(), config.aggregator.clone(), events);
    // Once workers drain, one more scan settles the job
    let final_job = tokio::select! {
        watched = aggregator.watch(job.job_id, cancel.child_token()) => watched?,
        _ = workers_done.cancelled() => {
            match aggregator.scan_job(job.job_id).await? {
                ScanOutcome::InProgress { persisted, total } => {
                    warn!(persisted, total, "Workers finished but job is not ready");
                }
                outcome => info!(outcome = ?outcome, "Final scan"),
            }
            stores
                .jobs
                .get(job.job_id)
                .await?
                .context("job record disappeared")?
        }
    };
    cancel.cancel();
    let _ = workers.await;

    println!("{}", serde_json::to_string_pretty(&final_job)?);
    if let Some(report) = load_report(&stores, final_job.job_id).await? {
        println!("{}", serde_json::to_string_pretty(&report.summary)?);
    }
    Ok(())
}

fn worker_pool(config: &EnrichConfig, stores: Stores, events: EventBus) -> Result<WorkerPool> {
    let enricher = Arc::new(BookEnricher::from_config(config)?);
    let worker = Worker::new(stores, enricher, config.worker.clone(), events);
    Ok(WorkerPool::new(worker, config.worker.concurrency))
}

fn read_books(path: &Path) -> Result<Vec<BookIdentity>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let books: Vec<BookIdentity> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of books", path.display()))?;
    info!("Loaded {} books from {}", books.len(), path.display());
    Ok(books)
}

/// Log pipeline events until cancelled
async fn log_events(events: EventBus, cancel: CancellationToken) {
    let mut rx = events.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(EnrichEvent::JobProgress { job_id, completed_items, total_items, .. }) => {
                    info!(job_id = %job_id, completed_items, total_items, "Progress");
                }
                Ok(EnrichEvent::ItemDeadLettered { job_id, item_key, reason, .. }) => {
                    warn!(job_id = %job_id, item_key = %item_key, reason = %reason, "Item dead-lettered");
                }
                Ok(EnrichEvent::JobCompleted { job_id, total_items, successful_items, .. }) => {
                    info!(job_id = %job_id, total_items, successful_items, "Job completed");
                }
                Ok(EnrichEvent::JobFailed { job_id, message, .. }) => {
                    warn!(job_id = %job_id, message = %message, "Job failed");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Cancel on Ctrl+C or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown requested");
    cancel.cancel();
}
