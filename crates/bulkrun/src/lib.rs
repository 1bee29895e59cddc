pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod health;
pub mod logging;
pub mod merge;
pub mod model;
pub mod notify;
pub mod planner;
pub mod queue;
pub mod reconcile;
pub mod sanitize;
pub mod submit;
pub mod worker;

pub use config::{load_config, load_effective_config, Config};
pub use db::{ConnectionPool, JobStore, PoolConfig, StoreError, StoreHealth};
pub use error::{BulkrunError, ConfigError, MergeError, NotifyError, PlanError, Result};
pub use executor::{BatchExecutor, BatchRequest, CommandExecutor, ExecutorError};
pub use model::{Batch, BatchStatus, Job, JobResult, JobStatus};
pub use notify::{NoopNotifier, Notification, Notifier, WebhookNotifier};
pub use planner::Planner;
pub use queue::{ChannelQueue, JobDescriptor, QueueError, RedisQueue, WorkQueue};
pub use reconcile::reconcile_stale_queued;
pub use submit::submit_job;
pub use worker::{JobOutcome, JobProcessor, RetryPolicy, WorkerPool, MAX_RETRIES};
