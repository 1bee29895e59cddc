//! The batch executor seam.
//!
//! The worker never knows how a batch is scraped or summarized; it hands an
//! executor one batch input and a place to write the output.

mod command;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use command::CommandExecutor;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Batch process exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Batch process timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Batch process reported success but wrote no output at '{0}'")]
    MissingOutput(PathBuf),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Rejected(String),
}

/// One invocation of an executor.
#[derive(Debug, Clone, Copy)]
pub struct BatchRequest<'a> {
    pub job_id: i64,
    pub batch_index: i64,
    /// 1-based attempt number within the current worker pass.
    pub attempt: u32,
    /// Document describing the batch input.
    pub input: &'a Path,
    /// Where the tabular result must be written.
    pub output: &'a Path,
}

pub trait BatchExecutor: Send + Sync {
    /// Runs one batch. `Ok` means the output file was written.
    fn execute(&self, request: &BatchRequest<'_>) -> Result<(), ExecutorError>;
}
