use std::path::{Path, PathBuf};

use crate::error::BulkrunError;

/// On-disk working area of one job under the jobs directory:
///
/// ```text
/// job_{id}/batches/         planned batch inputs
/// job_{id}/outputs/         batch outputs, input documents, stderr logs
/// job_{id}_final.csv        merged artifact
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    pub root: PathBuf,
    pub batches_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub artifact: PathBuf,
}

impl JobLayout {
    pub fn new(jobs_dir: &Path, job_id: i64) -> Self {
        let root = jobs_dir.join(format!("job_{}", job_id));
        Self {
            batches_dir: root.join("batches"),
            outputs_dir: root.join("outputs"),
            artifact: jobs_dir.join(format!("job_{}_final.csv", job_id)),
            root,
        }
    }

    pub fn create(&self) -> Result<(), BulkrunError> {
        for dir in [&self.batches_dir, &self.outputs_dir] {
            std::fs::create_dir_all(dir).map_err(|e| BulkrunError::Io {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    pub fn output_for(&self, batch_index: i64) -> PathBuf {
        self.outputs_dir
            .join(format!("batch_{:04}_output.csv", batch_index))
    }

    pub fn input_document_for(&self, batch_index: i64) -> PathBuf {
        self.outputs_dir
            .join(format!("batch_{:04}_input.json", batch_index))
    }
}
