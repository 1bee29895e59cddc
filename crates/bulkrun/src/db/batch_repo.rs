//! Batch repository: operations on the `batches` table.
//!
//! Batch indices of a job always form the contiguous range `0..N`: a batch can
//! only be created at the next free index. A batch reaches `finished` only
//! together with its output locator, in one transaction.

use rusqlite::{params, OptionalExtension, Row, Transaction};

use super::error::{require_non_empty, require_positive_id};
use super::{now_timestamp, parse_optional_timestamp, JobStore, StoreError};
use crate::model::{Batch, BatchStatus};

const SELECT_BATCH: &str = "SELECT id, job_id, batch_index, input_locator, output_locator, status,
     attempts, started_at, finished_at, error FROM batches";

/// A raw batch row from the database.
struct BatchRow {
    id: i64,
    job_id: i64,
    batch_index: i64,
    input_locator: String,
    output_locator: Option<String>,
    status: String,
    attempts: u32,
    started_at: Option<String>,
    finished_at: Option<String>,
    error: Option<String>,
}

impl BatchRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            batch_index: row.get("batch_index")?,
            input_locator: row.get("input_locator")?,
            output_locator: row.get("output_locator")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            error: row.get("error")?,
        })
    }

    fn into_batch(self) -> Result<Batch, StoreError> {
        let id = self.id;
        let status = self
            .status
            .parse::<BatchStatus>()
            .map_err(|e| StoreError::CorruptRow {
                table: "batches",
                id,
                reason: e.to_string(),
            })?;
        Ok(Batch {
            id,
            job_id: self.job_id,
            batch_index: self.batch_index,
            input_locator: self.input_locator,
            output_locator: self.output_locator,
            status,
            attempts: self.attempts,
            started_at: parse_optional_timestamp("batches", id, self.started_at)?,
            finished_at: parse_optional_timestamp("batches", id, self.finished_at)?,
            error: self.error,
        })
    }
}

fn collect_batches(
    rows: impl Iterator<Item = Result<BatchRow, rusqlite::Error>>,
) -> Result<Vec<Batch>, StoreError> {
    rows.map(|row| row.map_err(StoreError::from).and_then(BatchRow::into_batch))
        .collect()
}

fn next_batch_index(tx: &Transaction<'_>, job_id: i64) -> Result<i64, StoreError> {
    Ok(tx.query_row(
        "SELECT COALESCE(MAX(batch_index) + 1, 0) FROM batches WHERE job_id = ?1",
        params![job_id],
        |r| r.get(0),
    )?)
}

fn insert_batch(
    tx: &Transaction<'_>,
    job_id: i64,
    batch_index: i64,
    input_locator: &str,
) -> Result<i64, StoreError> {
    tx.execute(
        "INSERT INTO batches (job_id, batch_index, input_locator, status) VALUES (?1, ?2, ?3, ?4)",
        params![
            job_id,
            batch_index,
            input_locator,
            BatchStatus::Pending.as_str()
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

impl JobStore {
    /// Registers one batch at `batch_index`, which must be the next free
    /// index of the job.
    pub fn create_batch(
        &self,
        job_id: i64,
        batch_index: i64,
        input_locator: &str,
    ) -> Result<i64, StoreError> {
        require_positive_id("job_id", job_id)?;
        if batch_index < 0 {
            return Err(StoreError::InvalidArgument(format!(
                "batch_index must be a non-negative integer (got {})",
                batch_index
            )));
        }
        require_non_empty("input_locator", input_locator)?;

        let batch_id = self.with_tx(|tx| {
            let expected = next_batch_index(tx, job_id)?;
            if batch_index != expected {
                return Err(StoreError::InvalidArgument(format!(
                    "batch_index {} would leave a gap for job {} (next index is {})",
                    batch_index, job_id, expected
                )));
            }
            insert_batch(tx, job_id, batch_index, input_locator)
        })?;

        log::info!(
            "Created batch {} (index {}) for job {}",
            batch_id,
            batch_index,
            job_id
        );
        Ok(batch_id)
    }

    /// Registers a whole plan in one transaction: either every batch of the
    /// plan exists afterwards, or none does. Fails if the job already has
    /// batches.
    pub fn register_batches(
        &self,
        job_id: i64,
        input_locators: &[String],
    ) -> Result<Vec<i64>, StoreError> {
        require_positive_id("job_id", job_id)?;
        for locator in input_locators {
            require_non_empty("input_locator", locator)?;
        }

        let ids = self.with_tx(|tx| {
            if next_batch_index(tx, job_id)? != 0 {
                return Err(StoreError::InvalidArgument(format!(
                    "job {} already has batches",
                    job_id
                )));
            }
            input_locators
                .iter()
                .enumerate()
                .map(|(index, locator)| insert_batch(tx, job_id, index as i64, locator))
                .collect::<Result<Vec<_>, _>>()
        })?;

        log::info!("Registered {} batches for job {}", ids.len(), job_id);
        Ok(ids)
    }

    /// Moves a batch to `status`.
    ///
    /// Entering `running` counts an attempt and clears the previous error;
    /// entering `failed` records `finished_at` and the error. Entering
    /// `finished` requires an output locator to be recorded already; use
    /// [`JobStore::finish_batch`] to record both at once.
    pub fn update_batch_status(
        &self,
        batch_id: i64,
        status: BatchStatus,
        error_msg: Option<&str>,
    ) -> Result<bool, StoreError> {
        require_positive_id("batch_id", batch_id)?;

        let applied = self.with_tx(|tx| {
            let output: Option<Option<String>> = tx
                .query_row(
                    "SELECT output_locator FROM batches WHERE id = ?1",
                    params![batch_id],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(output) = output else {
                log::debug!("Status update for missing batch {} ignored", batch_id);
                return Ok(false);
            };

            let now = now_timestamp();
            match status {
                BatchStatus::Pending => {
                    tx.execute(
                        "UPDATE batches SET status = ?2 WHERE id = ?1",
                        params![batch_id, status.as_str()],
                    )?;
                }
                BatchStatus::Running => {
                    tx.execute(
                        "UPDATE batches SET status = ?2, started_at = ?3, finished_at = NULL,
                         error = NULL, attempts = attempts + 1 WHERE id = ?1",
                        params![batch_id, status.as_str(), now],
                    )?;
                }
                BatchStatus::Finished => {
                    if output.is_none() {
                        return Err(StoreError::InvalidArgument(format!(
                            "batch {} cannot finish without an output locator",
                            batch_id
                        )));
                    }
                    tx.execute(
                        "UPDATE batches SET status = ?2, finished_at = ?3, error = NULL WHERE id = ?1",
                        params![batch_id, status.as_str(), now],
                    )?;
                }
                BatchStatus::Failed => {
                    let message = error_msg
                        .filter(|m| !m.trim().is_empty())
                        .unwrap_or("batch failed");
                    tx.execute(
                        "UPDATE batches SET status = ?2, finished_at = ?3, error = ?4 WHERE id = ?1",
                        params![batch_id, status.as_str(), now, message],
                    )?;
                }
            }
            Ok(true)
        })?;

        if applied {
            log::info!("Updated batch {} status to {}", batch_id, status);
        }
        Ok(applied)
    }

    /// Records where a batch's output lives without changing its status.
    pub fn save_batch_output(
        &self,
        batch_id: i64,
        output_locator: &str,
    ) -> Result<bool, StoreError> {
        require_positive_id("batch_id", batch_id)?;
        require_non_empty("output_locator", output_locator)?;

        let changed = self.with_tx(|tx| {
            Ok(tx.execute(
                "UPDATE batches SET output_locator = ?2 WHERE id = ?1",
                params![batch_id, output_locator],
            )?)
        })?;
        if changed > 0 {
            log::info!("Saved output locator for batch {}", batch_id);
        }
        Ok(changed > 0)
    }

    /// Records the output locator and marks the batch `finished` in one
    /// transaction.
    pub fn finish_batch(&self, batch_id: i64, output_locator: &str) -> Result<bool, StoreError> {
        require_positive_id("batch_id", batch_id)?;
        require_non_empty("output_locator", output_locator)?;

        let changed = self.with_tx(|tx| {
            Ok(tx.execute(
                "UPDATE batches SET output_locator = ?2, status = ?3, finished_at = ?4,
                 error = NULL WHERE id = ?1",
                params![
                    batch_id,
                    output_locator,
                    BatchStatus::Finished.as_str(),
                    now_timestamp()
                ],
            )?)
        })?;
        if changed > 0 {
            log::info!("Batch {} finished with output {}", batch_id, output_locator);
        }
        Ok(changed > 0)
    }

    /// Finds a batch by its id.
    pub fn get_batch(&self, batch_id: i64) -> Result<Option<Batch>, StoreError> {
        require_positive_id("batch_id", batch_id)?;
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{} WHERE id = ?1", SELECT_BATCH),
                    params![batch_id],
                    BatchRow::from_row,
                )
                .optional()?;
            row.map(BatchRow::into_batch).transpose()
        })
    }

    /// All batches of a job by ascending `batch_index`.
    pub fn get_batches(&self, job_id: i64) -> Result<Vec<Batch>, StoreError> {
        require_positive_id("job_id", job_id)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE job_id = ?1 ORDER BY batch_index ASC",
                SELECT_BATCH
            ))?;
            let rows = stmt.query_map(params![job_id], BatchRow::from_row)?;
            collect_batches(rows)
        })
    }

    /// Batches still to be attempted (`pending` or `failed`), by
    /// ascending `batch_index`.
    pub fn get_pending_batches(&self, job_id: i64) -> Result<Vec<Batch>, StoreError> {
        require_positive_id("job_id", job_id)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE job_id = ?1 AND status IN (?2, ?3) ORDER BY batch_index ASC",
                SELECT_BATCH
            ))?;
            let rows = stmt.query_map(
                params![
                    job_id,
                    BatchStatus::Pending.as_str(),
                    BatchStatus::Failed.as_str()
                ],
                BatchRow::from_row,
            )?;
            collect_batches(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_store;
    use serde_json::json;

    fn store_with_job() -> (tempfile::TempDir, JobStore, i64) {
        let (dir, store) = temp_store();
        let job_id = store
            .create_job(&json!({ "query": "q" }), "a@example.com")
            .unwrap();
        (dir, store, job_id)
    }

    fn locators(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("/jobs/batch_{:04}.csv", i)).collect()
    }

    #[test]
    fn test_create_batches_in_order() {
        let (_dir, store, job_id) = store_with_job();
        for (i, loc) in locators(3).iter().enumerate() {
            store.create_batch(job_id, i as i64, loc).unwrap();
        }

        let batches = store.get_batches(job_id).unwrap();
        let indices: Vec<i64> = batches.iter().map(|b| b.batch_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(batches.iter().all(|b| b.status == BatchStatus::Pending));
        assert!(batches.iter().all(|b| b.attempts == 0));
    }

    #[test]
    fn test_create_batch_rejects_gap_and_duplicate() {
        let (_dir, store, job_id) = store_with_job();
        store.create_batch(job_id, 0, "a").unwrap();

        let gap = store.create_batch(job_id, 2, "c").unwrap_err();
        assert!(matches!(gap, StoreError::InvalidArgument(_)));

        let dup = store.create_batch(job_id, 0, "a").unwrap_err();
        assert!(matches!(dup, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_create_batch_for_missing_job_is_storage_error() {
        let (_dir, store) = temp_store();
        let err = store.create_batch(77, 0, "a").unwrap_err();
        assert!(err.is_storage());
    }

    #[test]
    fn test_register_batches_is_all_or_nothing() {
        let (_dir, store, job_id) = store_with_job();
        let ids = store.register_batches(job_id, &locators(4)).unwrap();
        assert_eq!(ids.len(), 4);

        let again = store.register_batches(job_id, &locators(4)).unwrap_err();
        assert!(matches!(again, StoreError::InvalidArgument(_)));
        assert_eq!(store.get_batches(job_id).unwrap().len(), 4);

        let bad = vec!["ok".to_string(), " ".to_string()];
        let (_dir2, other, other_job) = store_with_job();
        assert!(other.register_batches(other_job, &bad).is_err());
        assert!(other.get_batches(other_job).unwrap().is_empty());
    }

    #[test]
    fn test_running_counts_attempts_and_clears_error() {
        let (_dir, store, job_id) = store_with_job();
        let id = store.create_batch(job_id, 0, "a").unwrap();

        store.update_batch_status(id, BatchStatus::Running, None).unwrap();
        store
            .update_batch_status(id, BatchStatus::Failed, Some("timeout"))
            .unwrap();
        let failed = store.get_batch(id).unwrap().unwrap();
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.error.as_deref(), Some("timeout"));
        assert!(failed.finished_at.is_some());

        store.update_batch_status(id, BatchStatus::Running, None).unwrap();
        let running = store.get_batch(id).unwrap().unwrap();
        assert_eq!(running.attempts, 2);
        assert!(running.error.is_none());
        assert!(running.finished_at.is_none());
        assert!(running.started_at.is_some());
    }

    #[test]
    fn test_finished_requires_output_locator() {
        let (_dir, store, job_id) = store_with_job();
        let id = store.create_batch(job_id, 0, "a").unwrap();

        let err = store
            .update_batch_status(id, BatchStatus::Finished, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert_eq!(
            store.get_batch(id).unwrap().unwrap().status,
            BatchStatus::Pending
        );

        store.save_batch_output(id, "/out/a.csv").unwrap();
        assert!(store
            .update_batch_status(id, BatchStatus::Finished, None)
            .unwrap());
        let batch = store.get_batch(id).unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Finished);
        assert_eq!(batch.output_locator.as_deref(), Some("/out/a.csv"));
    }

    #[test]
    fn test_finish_batch_records_output_and_status() {
        let (_dir, store, job_id) = store_with_job();
        let id = store.create_batch(job_id, 0, "a").unwrap();
        store.update_batch_status(id, BatchStatus::Running, None).unwrap();

        assert!(store.finish_batch(id, "/out/a.csv").unwrap());
        let batch = store.get_batch(id).unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Finished);
        assert_eq!(batch.output_locator.as_deref(), Some("/out/a.csv"));
        assert!(batch.finished_at.is_some());
        assert!(batch.error.is_none());
    }

    #[test]
    fn test_pending_batches_include_failed() {
        let (_dir, store, job_id) = store_with_job();
        let ids = store.register_batches(job_id, &locators(3)).unwrap();
        store.finish_batch(ids[0], "/out/0.csv").unwrap();
        store
            .update_batch_status(ids[1], BatchStatus::Failed, Some("boom"))
            .unwrap();

        let pending: Vec<i64> = store
            .get_pending_batches(job_id)
            .unwrap()
            .iter()
            .map(|b| b.batch_index)
            .collect();
        assert_eq!(pending, vec![1, 2]);
    }

    #[test]
    fn test_missing_batch_updates_are_noops() {
        let (_dir, store) = temp_store();
        assert!(!store
            .update_batch_status(5, BatchStatus::Running, None)
            .unwrap());
        assert!(!store.save_batch_output(5, "x").unwrap());
        assert!(!store.finish_batch(5, "x").unwrap());
        assert!(store.get_batch(5).unwrap().is_none());
    }

    #[test]
    fn test_invalid_batch_arguments() {
        let (_dir, store, job_id) = store_with_job();
        assert!(matches!(
            store.create_batch(job_id, -1, "a").unwrap_err(),
            StoreError::InvalidArgument(_)
        ));
        assert!(matches!(
            store.create_batch(job_id, 0, "").unwrap_err(),
            StoreError::InvalidArgument(_)
        ));
        assert!(matches!(
            store.get_batches(0).unwrap_err(),
            StoreError::InvalidArgument(_)
        ));
        assert!(matches!(
            store.save_batch_output(1, " ").unwrap_err(),
            StoreError::InvalidArgument(_)
        ));
    }
}
