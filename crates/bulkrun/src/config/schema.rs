use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::PoolConfig;
use crate::queue::DEFAULT_QUEUE_NAME;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Root of the per-job working directories and final artifacts.
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".bulkrun").join("data"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn default_database_path() -> PathBuf {
    data_dir().join("jobs.db")
}

fn default_jobs_dir() -> PathBuf {
    data_dir().join("jobs")
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            database_path: default_database_path(),
            jobs_dir: default_jobs_dir(),
            worker_count: default_worker_count(),
            queue: QueueConfig::default(),
            pool: PoolConfig::default(),
            batching: BatchingConfig::default(),
            retry: RetryConfig::default(),
            executor: ExecutorConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_dequeue_timeout")]
    pub dequeue_timeout_secs: u64,
    /// How long a worker's claim on a job lasts without renewal. Renewed
    /// around every batch attempt, so it must outlast one executor run.
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_queue_name() -> String {
    DEFAULT_QUEUE_NAME.to_string()
}

fn default_dequeue_timeout() -> u64 {
    10
}

fn default_claim_lease() -> u64 {
    3600
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            name: default_queue_name(),
            dequeue_timeout_secs: default_dequeue_timeout(),
            claim_lease_secs: default_claim_lease(),
        }
    }
}

impl QueueConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Maximum data rows per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    10_000
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff after attempt `n` is `base_delay_secs * n`.
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    crate::worker::MAX_RETRIES
}

fn default_base_delay() -> u64 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Program and leading arguments. The batch input and output paths are
    /// appended.
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default = "default_executor_timeout")]
    pub timeout_secs: u64,
}

fn default_command() -> Vec<String> {
    vec!["bulkrun-batch".to_string()]
}

fn default_executor_timeout() -> u64 {
    600
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            timeout_secs: default_executor_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_webhook_timeout(),
        }
    }
}
