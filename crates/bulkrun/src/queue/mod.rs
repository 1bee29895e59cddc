//! Work queue between submission and the workers.
//!
//! Delivery is at-least-once and the queue is never the source of truth for
//! job state: a descriptor only tells a worker which job row to look at.

mod memory;
mod redis_queue;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use memory::ChannelQueue;
pub use redis_queue::RedisQueue;

/// Default broker list name.
pub const DEFAULT_QUEUE_NAME: &str = "job_queue";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("Malformed job descriptor: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Queue is closed")]
    Closed,
}

/// The message pushed for every submitted job: the submitted input document
/// with the assigned `job_id` next to its own keys (`query`, `inputType`,
/// `inputPath`, `webhook`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: i64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl JobDescriptor {
    pub fn new(job_id: i64, input: &Value) -> Self {
        let mut fields = match input {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other.clone());
                map
            }
        };
        fields.remove("job_id");
        Self { job_id, fields }
    }

    /// The submitted input without the `job_id`.
    pub fn input(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Notification target, if the submitter asked for one.
    pub fn webhook(&self) -> Option<&str> {
        self.fields
            .get("webhook")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn to_json(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// FIFO channel of job descriptors.
pub trait WorkQueue: Send + Sync {
    /// Pushes onto the tail. Never blocks on consumers.
    fn enqueue(&self, descriptor: &JobDescriptor) -> Result<(), QueueError>;

    /// Pops from the head, waiting at most `timeout`. `Ok(None)` means no work
    /// arrived in time, which is the normal idle outcome.
    fn dequeue(&self, timeout: Duration) -> Result<Option<JobDescriptor>, QueueError>;

    /// Current backlog.
    fn length(&self) -> Result<usize, QueueError>;
}
