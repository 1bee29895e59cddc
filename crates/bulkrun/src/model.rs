//! Job and batch records as persisted by the job store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::StoreError;

/// Lifecycle of a job. Transitions only move forward:
/// `queued -> running -> {finished | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            other => Err(StoreError::InvalidArgument(format!(
                "status must be one of: queued, running, finished, failed (got '{}')",
                other
            ))),
        }
    }
}

/// Lifecycle of a batch. Unlike jobs, batches may cycle back to `running`
/// when they are retried or resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Finished => "finished",
            BatchStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "running" => Ok(BatchStatus::Running),
            "finished" => Ok(BatchStatus::Finished),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(StoreError::InvalidArgument(format!(
                "status must be one of: pending, running, finished, failed (got '{}')",
                other
            ))),
        }
    }
}

/// A user-submitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: i64,
    pub owner: String,
    /// The submitted input document, stored verbatim.
    pub input: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Structured pointer to the merged artifact, see [`JobResult`].
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// One bounded slice of a job's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub id: i64,
    pub job_id: i64,
    pub batch_index: i64,
    pub input_locator: String,
    pub output_locator: Option<String>,
    pub status: BatchStatus,
    /// Number of times this batch entered `running`.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Result document saved on a job once its batches have been merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Location of the merged artifact.
    pub artifact: String,
    /// Data rows in the merged artifact.
    pub rows: usize,
    /// Output locators that went into the merge, in batch order.
    pub batches: Vec<String>,
    /// Indices of batches left `failed` and therefore omitted from the merge.
    pub failed_batches: Vec<i64>,
    /// Indices of batches that finished but whose output was empty or
    /// unreadable, and therefore contributed no rows.
    #[serde(default)]
    pub skipped_batches: Vec<i64>,
}

impl JobResult {
    /// Some batch contributed nothing to the artifact.
    pub fn is_partial(&self) -> bool {
        !self.failed_batches.is_empty() || !self.skipped_batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_status_is_invalid_argument() {
        let err = "done".parse::<JobStatus>().unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));

        let err = "queued".parse::<BatchStatus>().unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&BatchStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
    }

    #[test]
    fn test_job_result_partial() {
        let mut result = JobResult {
            artifact: "/jobs/job_1_final.csv".to_string(),
            rows: 10,
            batches: vec!["a.csv".to_string()],
            failed_batches: vec![],
            skipped_batches: vec![],
        };
        assert!(!result.is_partial());
        result.failed_batches.push(1);
        assert!(result.is_partial());

        result.failed_batches.clear();
        result.skipped_batches.push(2);
        assert!(result.is_partial());
    }

    #[test]
    fn test_job_result_without_skipped_batches_decodes() {
        let result: JobResult = serde_json::from_value(serde_json::json!({
            "artifact": "/jobs/job_1_final.csv",
            "rows": 1,
            "batches": ["a.csv"],
            "failed_batches": [],
        }))
        .unwrap();
        assert!(result.skipped_batches.is_empty());
    }
}
