use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use bulkrun::config::{load_effective_config, Config};
use bulkrun::health;
use bulkrun::logging::{init_logging, LoggingConfig};
use bulkrun::reconcile::DEFAULT_STALE_AFTER;
use bulkrun::{
    reconcile_stale_queued, submit_job, BulkrunError, CommandExecutor, JobProcessor, JobStatus,
    JobStore, Planner, RedisQueue, RetryPolicy, WebhookNotifier, WorkQueue, WorkerPool,
};

#[derive(Parser)]
#[command(name = "bulkrun")]
#[command(version, about = "Bulk scrape-and-summarize job runner")]
struct Cli {
    /// JSON config file; environment variables override it
    #[arg(long, short, global = true, env = "BULKRUN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until Ctrl-C
    Worker {
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Submit a job
    Submit {
        #[arg(long)]
        owner: String,
        #[arg(long, conflicts_with = "csv", required_unless_present = "csv")]
        query: Option<String>,
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long)]
        webhook: Option<String>,
    },

    /// Show a job and its batches
    Status { job_id: i64 },

    /// List jobs, newest first
    List {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },

    /// Count jobs per status
    Stats,

    /// Re-enqueue queued jobs that were never picked up
    Reconcile {
        #[arg(long, default_value_t = DEFAULT_STALE_AFTER.as_secs())]
        older_than_secs: u64,
    },

    /// Print the queue backlog
    QueueLength,

    /// Check the database, the broker and the jobs directory
    Health,
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    if let Err(e) = init_logging(&LoggingConfig::from_env()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> bulkrun::Result<()> {
    let config = load_effective_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Worker { workers } => run_workers(&config, workers),
        Commands::Submit {
            owner,
            query,
            csv,
            webhook,
        } => {
            let mut input = match (query, csv) {
                (Some(query), _) => json!({ "query": query }),
                (None, Some(path)) => {
                    let path = std::fs::canonicalize(&path)
                        .map_err(|e| BulkrunError::Io { path, source: e })?;
                    json!({ "inputType": "csv", "inputPath": path.to_string_lossy() })
                }
                (None, None) => {
                    return Err(BulkrunError::InvalidSubmission(
                        "either --query or --csv is required".to_string(),
                    ))
                }
            };
            if let Some(webhook) = webhook {
                input["webhook"] = json!(webhook);
            }

            let store = open_store(&config)?;
            let queue = open_queue(&config)?;
            let job_id = submit_job(&store, &queue, &input, &owner)?;
            print_json(&json!({ "job_id": job_id, "status": JobStatus::Queued }))
        }
        Commands::Status { job_id } => {
            let store = open_store(&config)?;
            let Some(job) = store.get_job(job_id)? else {
                return Err(BulkrunError::InvalidSubmission(format!(
                    "job {} not found",
                    job_id
                )));
            };
            let batches = store.get_batches(job_id)?;
            print_json(&json!({ "job": job, "batches": batches }))
        }
        Commands::List { owner, status } => {
            let store = open_store(&config)?;
            let status = status.map(|s| s.parse::<JobStatus>()).transpose()?;
            let jobs = match (owner.as_deref(), status) {
                (None, Some(status)) => store.list_jobs_by_status(status)?,
                (owner, status) => store
                    .list_jobs(owner)?
                    .into_iter()
                    .filter(|job| status.map_or(true, |s| job.status == s))
                    .collect(),
            };
            print_json(&jobs)
        }
        Commands::Stats => {
            let store = open_store(&config)?;
            let counts: serde_json::Map<String, serde_json::Value> = store
                .count_jobs_by_status()?
                .into_iter()
                .map(|(status, count)| (status.to_string(), json!(count)))
                .collect();
            print_json(&counts)
        }
        Commands::Reconcile { older_than_secs } => {
            let store = open_store(&config)?;
            let queue = open_queue(&config)?;
            let requeued =
                reconcile_stale_queued(&store, &queue, Duration::from_secs(older_than_secs))?;
            print_json(&json!({ "requeued": requeued }))
        }
        Commands::Health => {
            let store = JobStore::open(&config.database_path, &config.pool);
            let database = health::check_store(store.as_ref(), &config.database_path);
            let queue = match open_queue(&config) {
                Ok(queue) => health::check_queue(&queue, &config.queue.redis_url),
                Err(e) => health::Check {
                    healthy: false,
                    error: Some(e.to_string()),
                    details: Default::default(),
                },
            };
            let report =
                health::HealthReport::new(database, queue, health::check_jobs_dir(&config.jobs_dir));
            print_json(&report)?;
            if report.healthy {
                Ok(())
            } else {
                Err(BulkrunError::Unhealthy(
                    "one or more checks failed".to_string(),
                ))
            }
        }
        Commands::QueueLength => {
            let queue = open_queue(&config)?;
            print_json(&json!({ "queue": queue.name(), "length": queue.length()? }))
        }
    }
}

fn open_store(config: &Config) -> bulkrun::Result<JobStore> {
    Ok(JobStore::open(&config.database_path, &config.pool)?)
}

fn open_queue(config: &Config) -> bulkrun::Result<RedisQueue> {
    Ok(RedisQueue::new(&config.queue.redis_url, &config.queue.name)?)
}

fn print_json<T: Serialize>(value: &T) -> bulkrun::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_workers(config: &Config, workers: Option<usize>) -> bulkrun::Result<()> {
    let store = open_store(config)?;
    let queue: Arc<dyn WorkQueue> = Arc::new(open_queue(config)?);
    let processor = Arc::new(JobProcessor::new(
        store,
        Arc::new(CommandExecutor::from_config(&config.executor)?),
        Arc::new(WebhookNotifier::new(Duration::from_secs(
            config.webhook.timeout_secs,
        ))?),
        Planner::new(config.batching.batch_size)?,
        RetryPolicy::from_config(&config.retry),
        config.jobs_dir.clone(),
    )
    .with_lease(config.queue.claim_lease()));

    let worker_count = workers.unwrap_or(config.worker_count);
    info!(
        workers = worker_count,
        queue = %config.queue.name,
        batch_size = config.batching.batch_size,
        "Worker starting, waiting for jobs"
    );
    let pool = WorkerPool::start(processor, queue, worker_count, config.queue.dequeue_timeout());

    let shutdown = pool.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Shutdown requested, finishing current jobs");
        shutdown.store(true, Ordering::Relaxed);
    }) {
        warn!(error = %e, "Could not install Ctrl-C handler");
    }

    pool.wait();
    Ok(())
}
