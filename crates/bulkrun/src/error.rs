use std::path::PathBuf;
use thiserror::Error;

use crate::executor::ExecutorError;
use crate::queue::QueueError;

#[derive(Error, Debug)]
pub enum BulkrunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] crate::db::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Health check failed: {0}")]
    Unhealthy(String),

    #[error("Job {job_id} was claimed by another worker")]
    ClaimLost { job_id: i64 },

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid value '{value}' for environment variable {name}")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Job input has no recognised source (expected 'query' or 'inputType' + 'inputPath')")]
    MissingInput,

    #[error("Unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to read input '{path}': {source}")]
    ReadInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed CSV in '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Failed to write batch file '{path}': {source}")]
    WriteBatch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Batch size must be positive")]
    InvalidBatchSize,
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Failed to write merged artifact '{path}': {source}")]
    WriteArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error while writing '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Webhook request to '{url}' failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Webhook '{url}' answered with status {status}")]
    Status { url: String, status: u16 },
}

pub type Result<T> = std::result::Result<T, BulkrunError>;
