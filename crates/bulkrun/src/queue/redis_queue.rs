use std::time::Duration;

use redis::{Client, Connection};

use super::{JobDescriptor, QueueError, WorkQueue};

/// Work queue backed by a Redis list: `RPUSH` to enqueue, `BLPOP` to
/// dequeue, `LLEN` for the backlog. Descriptors travel as JSON strings.
pub struct RedisQueue {
    client: Client,
    name: String,
}

impl RedisQueue {
    pub fn new(redis_url: &str, name: &str) -> Result<Self, QueueError> {
        let client = Client::open(redis_url)?;
        Ok(Self {
            client,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks that the broker answers `PING`.
    pub fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING").query(&mut conn)?;
        Ok(())
    }

    // One connection per call; a broken connection never outlives the call
    // that saw it fail.
    fn connection(&self) -> Result<Connection, QueueError> {
        Ok(self.client.get_connection()?)
    }
}

/// BLPOP treats 0 as "block forever", so sub-millisecond timeouts are
/// rounded up.
fn blpop_timeout(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(0.001)
}

impl WorkQueue for RedisQueue {
    fn enqueue(&self, descriptor: &JobDescriptor) -> Result<(), QueueError> {
        let payload = descriptor.to_json()?;
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.name)
            .arg(payload)
            .query(&mut conn)?;
        tracing::debug!(job_id = descriptor.job_id, queue = %self.name, "Enqueued job");
        Ok(())
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<JobDescriptor>, QueueError> {
        let mut conn = self.connection()?;
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&self.name)
            .arg(blpop_timeout(timeout))
            .query(&mut conn)?;

        match popped {
            Some((_list, payload)) => Ok(Some(JobDescriptor::from_json(&payload)?)),
            None => Ok(None),
        }
    }

    fn length(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection()?;
        let len: usize = redis::cmd("LLEN").arg(&self.name).query(&mut conn)?;
        Ok(len)
    }
}
