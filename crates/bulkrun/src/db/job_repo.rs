//! Job repository: operations on the `jobs` table.
//!
//! Status updates are lenient: a transition that targets a missing job, or
//! that would move a job backwards or out of a terminal state, is a no-op that
//! returns `Ok(false)`. Applied transitions return `Ok(true)`.
//!
//! Workers do not move jobs to `running` through the plain status update;
//! they claim them ([`JobStore::claim_job`]) under a lease so that only one
//! worker runs a job at a time, while a job whose worker died can still be
//! taken over once the lease runs out.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::error::{require_non_empty, require_positive_id};
use super::{
    format_timestamp, now_timestamp, parse_optional_timestamp, parse_timestamp, JobStore,
    StoreError,
};
use crate::model::{Job, JobResult, JobStatus};

const SELECT_JOB: &str = "SELECT id, owner, input, status, created_at, started_at, finished_at,
     result, error FROM jobs";

/// A raw job row from the database.
struct JobRow {
    id: i64,
    owner: String,
    input: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    result: Option<String>,
    error: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            owner: row.get("owner")?,
            input: row.get("input")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            result: row.get("result")?,
            error: row.get("error")?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let id = self.id;
        let corrupt = move |reason: String| StoreError::CorruptRow {
            table: "jobs",
            id,
            reason,
        };
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let input = serde_json::from_str(&self.input)
            .map_err(|e| corrupt(format!("bad input document: {}", e)))?;
        let result = match self.result.as_deref() {
            Some(raw) => Some(
                serde_json::from_str(raw)
                    .map_err(|e| corrupt(format!("bad result document: {}", e)))?,
            ),
            None => None,
        };

        Ok(Job {
            id: self.id,
            owner: self.owner,
            input,
            status,
            created_at: parse_timestamp("jobs", id, &self.created_at)?,
            started_at: parse_optional_timestamp("jobs", id, self.started_at)?,
            finished_at: parse_optional_timestamp("jobs", id, self.finished_at)?,
            result,
            error: self.error,
        })
    }
}

fn collect_jobs(
    rows: impl Iterator<Item = Result<JobRow, rusqlite::Error>>,
) -> Result<Vec<Job>, StoreError> {
    rows.map(|row| row.map_err(StoreError::from).and_then(JobRow::into_job))
        .collect()
}

/// Whether a job may move from `from` to `to`.
fn transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    match (from, to) {
        (JobStatus::Queued, JobStatus::Queued) => true,
        (JobStatus::Queued, JobStatus::Running) => true,
        (JobStatus::Queued | JobStatus::Running, JobStatus::Finished | JobStatus::Failed) => true,
        _ => false,
    }
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>, StoreError> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| StoreError::InvalidArgument(format!("lease {:?} out of range", lease)))
}

impl JobStore {
    /// Inserts a new job with status `queued` and returns its id.
    ///
    /// `input` must be a JSON object; `owner` must be non-empty (format
    /// validation is the caller's job).
    pub fn create_job(&self, input: &serde_json::Value, owner: &str) -> Result<i64, StoreError> {
        if !input.is_object() {
            return Err(StoreError::InvalidArgument(
                "input must be a JSON object".to_string(),
            ));
        }
        require_non_empty("owner", owner)?;

        let encoded = serde_json::to_string(input)?;
        let job_id = self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO jobs (owner, input, status, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![owner, encoded, JobStatus::Queued.as_str(), now_timestamp()],
            )?;
            Ok(tx.last_insert_rowid())
        })?;

        log::info!("Created job {} for owner {}", job_id, owner);
        Ok(job_id)
    }

    /// Moves a job to `status`, applying the timestamp side effects in the
    /// same transaction: `started_at` on entry to `running`, `finished_at`
    /// and `error` on entry to a terminal state.
    pub fn update_job_status(
        &self,
        job_id: i64,
        status: JobStatus,
        error_msg: Option<&str>,
    ) -> Result<bool, StoreError> {
        require_positive_id("job_id", job_id)?;

        let applied = self.with_tx(|tx| {
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM jobs WHERE id = ?1",
                    params![job_id],
                    |r| r.get(0),
                )
                .optional()?;

            let Some(current) = current else {
                log::debug!("Status update for missing job {} ignored", job_id);
                return Ok(false);
            };
            let current = current
                .parse::<JobStatus>()
                .map_err(|e| StoreError::CorruptRow {
                    table: "jobs",
                    id: job_id,
                    reason: e.to_string(),
                })?;

            if !transition_allowed(current, status) {
                log::debug!(
                    "Job {} transition {} -> {} ignored",
                    job_id,
                    current,
                    status
                );
                return Ok(false);
            }

            let now = now_timestamp();
            match status {
                JobStatus::Queued => {}
                JobStatus::Running => {
                    tx.execute(
                        "UPDATE jobs SET status = ?2, started_at = ?3 WHERE id = ?1",
                        params![job_id, status.as_str(), now],
                    )?;
                }
                JobStatus::Finished => {
                    tx.execute(
                        "UPDATE jobs SET status = ?2, finished_at = ?3, error = NULL,
                         claimed_by = NULL, lease_expires_at = NULL WHERE id = ?1",
                        params![job_id, status.as_str(), now],
                    )?;
                }
                JobStatus::Failed => {
                    let message = error_msg
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or("job failed");
                    tx.execute(
                        "UPDATE jobs SET status = ?2, finished_at = ?3, error = ?4,
                         claimed_by = NULL, lease_expires_at = NULL WHERE id = ?1",
                        params![job_id, status.as_str(), now, message],
                    )?;
                }
            }
            Ok(true)
        })?;

        if applied {
            log::info!("Updated job {} status to {}", job_id, status);
        }
        Ok(applied)
    }

    /// Claims a job for `worker` until `lease` from now.
    ///
    /// Succeeds for a `queued` job (which moves to `running` and gets its
    /// `started_at`) and for a `running` job whose lease has expired or was
    /// never set; the original `started_at` is kept on takeover. Returns
    /// `Ok(false)` for missing and terminal jobs and for jobs held under a
    /// live lease.
    pub fn claim_job(&self, job_id: i64, worker: &str, lease: Duration) -> Result<bool, StoreError> {
        require_positive_id("job_id", job_id)?;
        require_non_empty("worker", worker)?;
        let now = Utc::now();
        let expires = lease_deadline(now, lease)?;

        let changed = self.with_tx(|tx| {
            Ok(tx.execute(
                "UPDATE jobs SET status = ?2, started_at = COALESCE(started_at, ?3),
                     claimed_by = ?4, lease_expires_at = ?5
                 WHERE id = ?1
                   AND (status = ?6
                        OR (status = ?2 AND (lease_expires_at IS NULL OR lease_expires_at < ?3)))",
                params![
                    job_id,
                    JobStatus::Running.as_str(),
                    format_timestamp(now),
                    worker,
                    format_timestamp(expires),
                    JobStatus::Queued.as_str(),
                ],
            )?)
        })?;

        if changed > 0 {
            log::info!("Job {} claimed by {}", job_id, worker);
        } else {
            log::debug!("Job {} not claimable by {}", job_id, worker);
        }
        Ok(changed > 0)
    }

    /// Extends `worker`'s lease on a running job. Returns `Ok(false)` when
    /// the job is no longer running under that worker's claim.
    pub fn renew_claim(&self, job_id: i64, worker: &str, lease: Duration) -> Result<bool, StoreError> {
        require_positive_id("job_id", job_id)?;
        let expires = lease_deadline(Utc::now(), lease)?;
        let changed = self.with_tx(|tx| {
            Ok(tx.execute(
                "UPDATE jobs SET lease_expires_at = ?3
                 WHERE id = ?1 AND status = ?4 AND claimed_by = ?2",
                params![
                    job_id,
                    worker,
                    format_timestamp(expires),
                    JobStatus::Running.as_str(),
                ],
            )?)
        })?;
        Ok(changed > 0)
    }

    /// Current holder of a job's claim, if any.
    pub fn job_claim(&self, job_id: i64) -> Result<Option<String>, StoreError> {
        require_positive_id("job_id", job_id)?;
        self.with_conn(|conn| {
            let holder: Option<Option<String>> = conn
                .query_row(
                    "SELECT claimed_by FROM jobs WHERE id = ?1",
                    params![job_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(holder.flatten())
        })
    }

    /// Stores the merge result document on the job.
    pub fn save_job_result(&self, job_id: i64, result: &JobResult) -> Result<bool, StoreError> {
        require_positive_id("job_id", job_id)?;
        let encoded = serde_json::to_string(result)?;
        let changed = self.with_tx(|tx| {
            Ok(tx.execute(
                "UPDATE jobs SET result = ?2 WHERE id = ?1",
                params![job_id, encoded],
            )?)
        })?;
        if changed > 0 {
            log::info!("Saved result for job {}", job_id);
        }
        Ok(changed > 0)
    }

    /// Finds a job by its id.
    pub fn get_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
        require_positive_id("job_id", job_id)?;
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{} WHERE id = ?1", SELECT_JOB),
                    params![job_id],
                    JobRow::from_row,
                )
                .optional()?;
            row.map(JobRow::into_job).transpose()
        })
    }

    /// Lists jobs newest first, optionally restricted to one owner.
    pub fn list_jobs(&self, owner: Option<&str>) -> Result<Vec<Job>, StoreError> {
        self.with_conn(|conn| match owner {
            Some(owner) => {
                let mut stmt =
                    conn.prepare(&format!("{} WHERE owner = ?1 ORDER BY id DESC", SELECT_JOB))?;
                let rows = stmt.query_map(params![owner], JobRow::from_row)?;
                collect_jobs(rows)
            }
            None => {
                let mut stmt = conn.prepare(&format!("{} ORDER BY id DESC", SELECT_JOB))?;
                let rows = stmt.query_map([], JobRow::from_row)?;
                collect_jobs(rows)
            }
        })
    }

    /// Lists jobs in one status, newest first.
    pub fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{} WHERE status = ?1 ORDER BY id DESC", SELECT_JOB))?;
            let rows = stmt.query_map(params![status.as_str()], JobRow::from_row)?;
            collect_jobs(rows)
        })
    }

    /// Counts jobs per status, in lifecycle order. Statuses without jobs
    /// report zero.
    pub fn count_jobs_by_status(&self) -> Result<Vec<(JobStatus, u64)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT COUNT(*) FROM jobs WHERE status = ?1")?;
            JobStatus::ALL
                .iter()
                .map(|status| -> Result<(JobStatus, u64), StoreError> {
                    let count: u64 =
                        stmt.query_row(params![status.as_str()], |r| r.get(0))?;
                    Ok((*status, count))
                })
                .collect()
        })
    }

    /// Queued jobs created before `cutoff`, oldest first.
    pub fn stale_queued_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE status = ?1 AND created_at < ?2 ORDER BY id ASC",
                SELECT_JOB
            ))?;
            let rows = stmt.query_map(
                params![JobStatus::Queued.as_str(), format_timestamp(cutoff)],
                JobRow::from_row,
            )?;
            collect_jobs(rows)
        })
    }
}
