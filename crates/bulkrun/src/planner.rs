//! Splits a job's input into bounded batches.
//!
//! A query job is always exactly one batch. A CSV job is sliced into
//! contiguous row ranges of `batch_size` rows, one file per slice, each with
//! the source header. Slicing streams the input and is deterministic: the
//! same file and batch size always give the same batch files in the same
//! order.

use std::fs::File;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::PlanError;

/// What a job's input document asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    /// A single opaque query.
    Query,
    Csv(PathBuf),
    Excel(PathBuf),
}

impl InputKind {
    /// Classifies an input document. A tabular `inputType` + `inputPath`
    /// pair wins over a `query` key.
    pub fn of(input: &Value) -> Result<Self, PlanError> {
        let input_type = input.get("inputType").and_then(Value::as_str);
        let input_path = input
            .get("inputPath")
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty());

        match (input_type, input_path) {
            (Some("csv"), Some(path)) => return Ok(InputKind::Csv(PathBuf::from(path))),
            (Some("excel"), Some(path)) => return Ok(InputKind::Excel(PathBuf::from(path))),
            (Some(other), Some(_)) if other != "query" => {
                return Err(PlanError::UnsupportedFormat(other.to_string()))
            }
            _ => {}
        }

        match input.get("query").and_then(Value::as_str) {
            Some(q) if !q.trim().is_empty() => Ok(InputKind::Query),
            _ => Err(PlanError::MissingInput),
        }
    }
}

pub struct Planner {
    batch_size: usize,
}

impl Planner {
    pub fn new(batch_size: usize) -> Result<Self, PlanError> {
        if batch_size == 0 {
            return Err(PlanError::InvalidBatchSize);
        }
        Ok(Self { batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Writes the batch inputs of `input` under `batches_dir` and returns
    /// their locators in batch order.
    pub fn plan(&self, input: &Value, batches_dir: &Path) -> Result<Vec<PathBuf>, PlanError> {
        let kind = InputKind::of(input)?;
        std::fs::create_dir_all(batches_dir).map_err(|e| PlanError::WriteBatch {
            path: batches_dir.to_path_buf(),
            source: e,
        })?;

        match kind {
            InputKind::Query => {
                let path = batches_dir.join("batch_0000.json");
                write_json(&path, input)?;
                Ok(vec![path])
            }
            InputKind::Csv(source) => self.slice_csv(&source, batches_dir),
            InputKind::Excel(_) => Err(PlanError::UnsupportedFormat("excel".to_string())),
        }
    }

    fn slice_csv(&self, source: &Path, batches_dir: &Path) -> Result<Vec<PathBuf>, PlanError> {
        let file = File::open(source).map_err(|e| PlanError::ReadInput {
            path: source.to_path_buf(),
            source: e,
        })?;
        let mut reader = csv::ReaderBuilder::new().from_reader(file);
        let headers = reader.byte_headers().map_err(csv_err(source))?.clone();

        let mut batches = Vec::new();
        let mut writer: Option<csv::Writer<File>> = None;
        let mut rows_in_batch = 0usize;

        for record in reader.byte_records() {
            let record = record.map_err(csv_err(source))?;

            if writer.is_none() || rows_in_batch == self.batch_size {
                if let Some(mut done) = writer.take() {
                    let path = batches.last().cloned().unwrap_or_default();
                    done.flush().map_err(|e| PlanError::WriteBatch { path, source: e })?;
                }
                let path = batches_dir.join(format!("batch_{:04}.csv", batches.len()));
                let mut next = csv::Writer::from_path(&path).map_err(csv_err(&path))?;
                next.write_byte_record(&headers).map_err(csv_err(&path))?;
                batches.push(path);
                writer = Some(next);
                rows_in_batch = 0;
            }

            if let (Some(w), Some(path)) = (writer.as_mut(), batches.last()) {
                w.write_byte_record(&record).map_err(csv_err(path))?;
            }
            rows_in_batch += 1;
        }

        if let (Some(mut w), Some(path)) = (writer, batches.last()) {
            w.flush().map_err(|e| PlanError::WriteBatch {
                path: path.clone(),
                source: e,
            })?;
        }

        tracing::debug!(batches = batches.len(), batch_size = self.batch_size, "CSV input sliced");
        Ok(batches)
    }
}

fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> PlanError {
    let path = path.to_path_buf();
    move |source| PlanError::Csv { path, source }
}

/// Builds the document handed to the executor for one tabular batch: the
/// job input with `inputPath` pointing at the batch slice.
pub fn batch_document(job_input: &Value, batch_locator: &Path) -> Value {
    let mut doc = match job_input {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    let input_type = match batch_locator.extension().and_then(|e| e.to_str()) {
        Some("csv") => "csv",
        Some("json") => "query",
        _ => "excel",
    };
    doc.insert("inputType".to_string(), Value::from(input_type));
    doc.insert(
        "inputPath".to_string(),
        Value::from(batch_locator.to_string_lossy().into_owned()),
    );
    Value::Object(doc)
}

pub(crate) fn write_json(path: &Path, value: &Value) -> Result<(), PlanError> {
    let write_err = |e: std::io::Error| PlanError::WriteBatch {
        path: path.to_path_buf(),
        source: e,
    };
    let body = serde_json::to_vec_pretty(value).map_err(|e| write_err(e.into()))?;
    std::fs::write(path, body).map_err(write_err)
}
