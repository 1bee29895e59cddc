//! Turns one dequeued job into a finished or failed job.
//!
//! The processor keeps no job state of its own. Everything it needs to
//! resume an interrupted job (which batches exist, which finished, where
//! their outputs are) is re-read from the store on every call.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;

use serde_json::Value;
use tracing::{error, info, info_span, warn};

use crate::db::{JobStore, StoreError};
use crate::error::BulkrunError;
use crate::executor::{BatchExecutor, BatchRequest, ExecutorError};
use crate::merge::merge_csv;
use crate::model::{Batch, BatchStatus, Job, JobResult, JobStatus};
use crate::notify::{Notification, Notifier};
use crate::planner::{batch_document, write_json, Planner};
use crate::queue::JobDescriptor;
use crate::worker::layout::JobLayout;
use crate::worker::retry::RetryPolicy;

/// How long a claim lasts when the processor is not given a lease.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(3600);

static NEXT_WORKER: AtomicU64 = AtomicU64::new(0);

/// Identity a processor claims jobs under. Unique per processor across
/// processes sharing one store.
fn worker_token() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        Utc::now().timestamp_micros(),
        NEXT_WORKER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Why a descriptor was dropped without work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnknownJob,
    AlreadyTerminal(JobStatus),
    /// Another worker holds a live claim on the job.
    ClaimedElsewhere,
    /// The claim expired mid-run and another worker took the job over.
    ClaimLost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Skipped(SkipReason),
    Finished(JobResult),
    Failed(String),
}

pub struct JobProcessor {
    store: JobStore,
    executor: Arc<dyn BatchExecutor>,
    notifier: Arc<dyn Notifier>,
    planner: Planner,
    retry: RetryPolicy,
    jobs_dir: PathBuf,
    worker: String,
    lease: Duration,
}

impl JobProcessor {
    pub fn new(
        store: JobStore,
        executor: Arc<dyn BatchExecutor>,
        notifier: Arc<dyn Notifier>,
        planner: Planner,
        retry: RetryPolicy,
        jobs_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            executor,
            notifier,
            planner,
            retry,
            jobs_dir,
            worker: worker_token(),
            lease: DEFAULT_CLAIM_LEASE,
        }
    }

    /// Sets how long a claim lasts between renewals. It has to outlast one
    /// executor run plus the retry delay.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// The identity this processor claims jobs under.
    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Processes the job a descriptor points at. Never returns an error:
    /// anything that goes wrong at job level ends up as the job's `failed`
    /// status and message.
    pub fn process(&self, descriptor: &JobDescriptor) -> JobOutcome {
        let job_id = descriptor.job_id;
        let span = info_span!("job", job_id);
        let _guard = span.enter();

        let job = match self.store.get_job(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!("Dropping descriptor for unknown job");
                return JobOutcome::Skipped(SkipReason::UnknownJob);
            }
            Err(e) => return self.fail(job_id, descriptor.webhook(), &BulkrunError::from(e)),
        };

        if job.status.is_terminal() {
            info!(status = %job.status, "Job already terminal, skipping");
            return JobOutcome::Skipped(SkipReason::AlreadyTerminal(job.status));
        }

        let webhook = descriptor
            .webhook()
            .or_else(|| job.input.get("webhook").and_then(Value::as_str))
            .map(str::to_string);

        match self.store.claim_job(job_id, &self.worker, self.lease) {
            Ok(true) => {}
            Ok(false) => {
                info!("Job claimed by another worker, skipping");
                return JobOutcome::Skipped(SkipReason::ClaimedElsewhere);
            }
            Err(e) => return self.fail(job_id, webhook.as_deref(), &BulkrunError::from(e)),
        }

        match self.run(&job) {
            Ok(result) => {
                info!(
                    rows = result.rows,
                    batches = result.batches.len(),
                    failed_batches = result.failed_batches.len(),
                    skipped_batches = result.skipped_batches.len(),
                    partial = result.is_partial(),
                    "Job finished"
                );
                self.send_notification(
                    webhook.as_deref(),
                    Notification {
                        job_id,
                        status: JobStatus::Finished,
                        result: serde_json::to_value(&result).ok(),
                        error: None,
                    },
                );
                JobOutcome::Finished(result)
            }
            Err(BulkrunError::ClaimLost { .. }) => {
                warn!("Lost claim on job, leaving it to its new worker");
                JobOutcome::Skipped(SkipReason::ClaimLost)
            }
            Err(e) => self.fail(job_id, webhook.as_deref(), &e),
        }
    }

    fn fail(&self, job_id: i64, webhook: Option<&str>, err: &BulkrunError) -> JobOutcome {
        let message = err.to_string();
        error!(error = %message, "Job failed");
        if let Err(e) = self
            .store
            .update_job_status(job_id, JobStatus::Failed, Some(&message))
        {
            error!(error = %e, "Could not record job failure");
        }
        self.send_notification(
            webhook,
            Notification {
                job_id,
                status: JobStatus::Failed,
                result: None,
                error: Some(message.clone()),
            },
        );
        JobOutcome::Failed(message)
    }

    fn send_notification(&self, webhook: Option<&str>, notification: Notification) {
        let Some(target) = webhook else {
            return;
        };
        if let Err(e) = self.notifier.notify(target, &notification) {
            warn!(error = %e, "Notification failed");
        }
    }

    /// Extends the claim, or reports that another worker has the job now.
    fn renew(&self, job_id: i64) -> Result<(), BulkrunError> {
        if self.store.renew_claim(job_id, &self.worker, self.lease)? {
            Ok(())
        } else {
            Err(BulkrunError::ClaimLost { job_id })
        }
    }

    /// Registers freshly planned batches. If batches appeared in the
    /// meantime, those win and are returned instead.
    fn register(&self, job_id: i64, locators: &[String]) -> Result<Vec<Batch>, BulkrunError> {
        match self.store.register_batches(job_id, locators) {
            Ok(_) => {
                info!(batches = locators.len(), "Job planned");
                Ok(self.store.get_batches(job_id)?)
            }
            Err(e @ StoreError::InvalidArgument(_)) => {
                let existing = self.store.get_batches(job_id)?;
                if existing.is_empty() {
                    return Err(e.into());
                }
                info!(batches = existing.len(), "Batches registered concurrently, using those");
                Ok(existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn run(&self, job: &Job) -> Result<JobResult, BulkrunError> {
        let layout = JobLayout::new(&self.jobs_dir, job.id);
        layout.create()?;

        let mut batches = self.store.get_batches(job.id)?;
        if batches.is_empty() {
            let locators: Vec<String> = self
                .planner
                .plan(&job.input, &layout.batches_dir)?
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            batches = self.register(job.id, &locators)?;
        } else {
            info!(batches = batches.len(), "Resuming planned job");
        }

        for batch in &batches {
            self.run_batch(job, batch, &layout)?;
        }
        self.renew(job.id)?;

        let batches = self.store.get_batches(job.id)?;
        let mut outputs: Vec<(i64, PathBuf)> = Vec::new();
        let mut failed_batches = Vec::new();
        for batch in &batches {
            match (&batch.status, &batch.output_locator) {
                (BatchStatus::Finished, Some(output)) => {
                    outputs.push((batch.batch_index, PathBuf::from(output)))
                }
                _ => failed_batches.push(batch.batch_index),
            }
        }

        let paths: Vec<PathBuf> = outputs.iter().map(|(_, path)| path.clone()).collect();
        let merged = merge_csv(&paths, &layout.artifact)?;
        let skipped_batches: Vec<i64> = outputs
            .iter()
            .filter(|(_, path)| merged.skipped.contains(path))
            .map(|(index, _)| *index)
            .collect();
        if !skipped_batches.is_empty() {
            warn!(?skipped_batches, "Finished batches with unusable output");
        }

        let result = JobResult {
            artifact: layout.artifact.to_string_lossy().into_owned(),
            rows: merged.rows,
            batches: merged
                .merged
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            failed_batches,
            skipped_batches,
        };

        self.store.save_job_result(job.id, &result)?;
        self.store
            .update_job_status(job.id, JobStatus::Finished, None)?;
        Ok(result)
    }

    /// Runs one batch with bounded retries. Executor failures stay on the
    /// batch; store and filesystem errors propagate, and so does losing the
    /// job's claim, which is renewed before every attempt.
    fn run_batch(&self, job: &Job, batch: &Batch, layout: &JobLayout) -> Result<(), BulkrunError> {
        let span = info_span!("batch", batch_index = batch.batch_index);
        let _guard = span.enter();

        let already_done = batch.status == BatchStatus::Finished
            && batch
                .output_locator
                .as_deref()
                .is_some_and(|p| Path::new(p).exists());
        if already_done {
            info!("Batch already finished, skipping");
            return Ok(());
        }

        let input = self.input_document(job, batch, layout)?;
        let output = layout.output_for(batch.batch_index);
        let output_locator = output.to_string_lossy().into_owned();

        for attempt in 1..=self.retry.max_attempts {
            self.renew(job.id)?;
            self.store
                .update_batch_status(batch.id, BatchStatus::Running, None)?;
            info!(attempt, "Running batch");

            let request = BatchRequest {
                job_id: job.id,
                batch_index: batch.batch_index,
                attempt,
                input: &input,
                output: &output,
            };
            let outcome = self.executor.execute(&request).and_then(|()| {
                if output.exists() {
                    Ok(())
                } else {
                    Err(ExecutorError::MissingOutput(output.clone()))
                }
            });

            match outcome {
                Ok(()) => {
                    self.store.finish_batch(batch.id, &output_locator)?;
                    info!(attempt, "Batch finished");
                    return Ok(());
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(attempt, error = %message, "Batch attempt failed");
                    self.store
                        .update_batch_status(batch.id, BatchStatus::Failed, Some(&message))?;
                    if let Some(delay) = self.retry.delay_after(attempt) {
                        thread::sleep(delay);
                    }
                }
            }
        }

        error!(
            attempts = self.retry.max_attempts,
            "Batch failed after all attempts"
        );
        Ok(())
    }

    /// The document handed to the executor. Query batches already are one;
    /// tabular slices get a copy of the job input pointing at the slice.
    fn input_document(
        &self,
        job: &Job,
        batch: &Batch,
        layout: &JobLayout,
    ) -> Result<PathBuf, BulkrunError> {
        let locator = PathBuf::from(&batch.input_locator);
        if locator.extension().and_then(|e| e.to_str()) == Some("json") {
            return Ok(locator);
        }
        let doc_path = layout.input_document_for(batch.batch_index);
        write_json(&doc_path, &batch_document(&job.input, &locator))?;
        Ok(doc_path)
    }
}
