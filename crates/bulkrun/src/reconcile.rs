//! Sweep for jobs that were stored but never made it onto the queue.
//!
//! Submission writes the job row before it enqueues, without a transaction
//! spanning both systems. A crash in between leaves a `queued` row nobody
//! will ever dequeue; this sweep re-enqueues such rows once they are older
//! than a threshold. A job that is in fact still on the queue gets delivered
//! twice, and the second delivery is dropped once the job is terminal.

use chrono::Utc;
use std::time::Duration;

use crate::db::JobStore;
use crate::error::{BulkrunError, Result};
use crate::queue::{JobDescriptor, WorkQueue};

/// Default age after which a `queued` job counts as orphaned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Re-enqueues every `queued` job created more than `older_than` ago and
/// returns their ids, oldest first.
pub fn reconcile_stale_queued(
    store: &JobStore,
    queue: &dyn WorkQueue,
    older_than: Duration,
) -> Result<Vec<i64>> {
    let age = chrono::Duration::from_std(older_than).map_err(|e| {
        BulkrunError::InvalidSubmission(format!("stale threshold out of range: {}", e))
    })?;
    let cutoff = Utc::now() - age;

    let mut requeued = Vec::new();
    for job in store.stale_queued_jobs(cutoff)? {
        queue.enqueue(&JobDescriptor::new(job.id, &job.input))?;
        tracing::info!(job_id = job.id, created_at = %job.created_at, "Re-enqueued stale job");
        requeued.push(job.id);
    }

    if !requeued.is_empty() {
        tracing::warn!(count = requeued.len(), "Reconciliation re-enqueued queued jobs");
    }
    Ok(requeued)
}
