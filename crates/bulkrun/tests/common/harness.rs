//! Test harness for isolated job processing.
//!
//! Each harness owns a temp directory holding the SQLite database, the
//! jobs directory and test inputs, plus an in-process queue.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use bulkrun::worker::JobLayout;
use bulkrun::{
    submit_job, BatchExecutor, ChannelQueue, JobDescriptor, JobOutcome, JobProcessor, JobStore,
    Notifier, NoopNotifier, Planner, PoolConfig, RetryPolicy, WorkQueue,
};

pub struct TestHarness {
    temp_dir: TempDir,
    pub store: JobStore,
    pub queue: Arc<ChannelQueue>,
    pub jobs_dir: PathBuf,
    pub input_dir: PathBuf,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();

        let jobs_dir = base.join("jobs");
        let input_dir = base.join("input");
        std::fs::create_dir_all(&input_dir).expect("Failed to create input dir");

        let pool = PoolConfig {
            max_size: 4,
            acquire_timeout_ms: 500,
            busy_timeout_ms: 5_000,
        };
        let store = JobStore::open(&base.join("data").join("jobs.db"), &pool)
            .expect("Failed to open job store");

        Self {
            temp_dir,
            store,
            queue: Arc::new(ChannelQueue::new()),
            jobs_dir,
            input_dir,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn input_path(&self, filename: &str) -> PathBuf {
        self.input_dir.join(filename)
    }

    pub fn layout(&self, job_id: i64) -> JobLayout {
        JobLayout::new(&self.jobs_dir, job_id)
    }

    /// A processor with no backoff between attempts.
    pub fn processor(
        &self,
        executor: Arc<dyn BatchExecutor>,
        batch_size: usize,
    ) -> JobProcessor {
        self.processor_with(executor, Arc::new(NoopNotifier), batch_size)
    }

    pub fn processor_with(
        &self,
        executor: Arc<dyn BatchExecutor>,
        notifier: Arc<dyn Notifier>,
        batch_size: usize,
    ) -> JobProcessor {
        JobProcessor::new(
            self.store.clone(),
            executor,
            notifier,
            Planner::new(batch_size).unwrap(),
            RetryPolicy::new(bulkrun::MAX_RETRIES, Duration::ZERO),
            self.jobs_dir.clone(),
        )
    }

    pub fn submit(&self, input: &Value) -> i64 {
        submit_job(&self.store, self.queue.as_ref(), input, "owner@example.com")
            .expect("submission failed")
    }

    /// Dequeues one descriptor and runs it.
    pub fn process_next(&self, processor: &JobProcessor) -> JobOutcome {
        let descriptor = self
            .queue
            .dequeue(Duration::from_millis(100))
            .unwrap()
            .expect("queue is empty");
        processor.process(&descriptor)
    }

    /// Runs a job directly, without going through the queue.
    pub fn process_job(&self, processor: &JobProcessor, job_id: i64) -> JobOutcome {
        let job = self.store.get_job(job_id).unwrap().unwrap();
        processor.process(&JobDescriptor::new(job_id, &job.input))
    }
}
