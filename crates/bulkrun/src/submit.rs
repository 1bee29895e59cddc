//! Submission path: store the job, then hand it to the queue.

use serde_json::Value;

use crate::db::JobStore;
use crate::error::{BulkrunError, Result};
use crate::model::JobStatus;
use crate::queue::{JobDescriptor, WorkQueue};

/// Checks that an input document names something the planner can work on:
/// a non-empty string `query`, or an `inputType` + `inputPath` pair.
pub fn validate_input(input: &Value) -> Result<()> {
    let Value::Object(map) = input else {
        return Err(BulkrunError::InvalidSubmission(
            "input must be a JSON object".to_string(),
        ));
    };
    let non_empty = |key: &str| {
        map.get(key)
            .and_then(Value::as_str)
            .is_some_and(|v| !v.trim().is_empty())
    };

    if non_empty("query") || (non_empty("inputType") && non_empty("inputPath")) {
        Ok(())
    } else {
        Err(BulkrunError::InvalidSubmission(
            "input needs a 'query' or an 'inputType' + 'inputPath' pair".to_string(),
        ))
    }
}

/// Creates the job, re-asserts `queued` and enqueues its descriptor, in that
/// order. If the enqueue fails the job row stays `queued`;
/// [`crate::reconcile::reconcile_stale_queued`] picks such rows up later.
pub fn submit_job(
    store: &JobStore,
    queue: &dyn WorkQueue,
    input: &Value,
    owner: &str,
) -> Result<i64> {
    validate_input(input)?;

    let job_id = store.create_job(input, owner)?;
    store.update_job_status(job_id, JobStatus::Queued, None)?;
    queue.enqueue(&JobDescriptor::new(job_id, input))?;

    tracing::info!(job_id, "Job submitted");
    Ok(job_id)
}
