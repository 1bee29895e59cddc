//! Test doubles and input builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use bulkrun::error::NotifyError;
use bulkrun::{BatchExecutor, BatchRequest, ExecutorError, Notification, Notifier};

/// Input document for a single-query job.
pub fn query_input(query: &str) -> Value {
    json!({ "query": query })
}

/// Input document for a CSV job.
pub fn csv_input(path: &Path) -> Value {
    json!({ "inputType": "csv", "inputPath": path.to_string_lossy() })
}

/// Writes a CSV with a `name,company` header and `rows` data rows.
pub fn write_csv(path: &Path, rows: usize) {
    let mut writer = csv::Writer::from_path(path).unwrap();
    writer.write_record(["name", "company"]).unwrap();
    for i in 0..rows {
        writer
            .write_record([format!("person {}", i), format!("company {}", i % 13)])
            .unwrap();
    }
    writer.flush().unwrap();
}

pub fn count_csv_rows(path: &Path) -> usize {
    csv::Reader::from_path(path).unwrap().records().count()
}

/// Executor whose behaviour is scripted per batch index.
///
/// Successful calls copy a CSV batch slice to the output unchanged, or write
/// a one-row result for query batches. Every call is recorded.
#[derive(Default)]
pub struct ScriptedExecutor {
    /// batch_index -> number of leading calls that fail
    failures: HashMap<i64, u32>,
    calls_per_batch: Mutex<HashMap<i64, u32>>,
    calls: Mutex<Vec<(i64, u32)>>,
    total: AtomicU32,
    delay: Duration,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `times` calls for `batch_index` fail.
    pub fn fail_times(mut self, batch_index: i64, times: u32) -> Self {
        self.failures.insert(batch_index, times);
        self
    }

    /// Every call for `batch_index` fails.
    pub fn always_fail(self, batch_index: i64) -> Self {
        self.fail_times(batch_index, u32::MAX)
    }

    /// Every call sleeps this long before doing anything.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `(batch_index, attempt)` of every call, in call order.
    pub fn calls(&self) -> Vec<(i64, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, batch_index: i64) -> usize {
        self.calls()
            .iter()
            .filter(|(index, _)| *index == batch_index)
            .count()
    }

    pub fn total_calls(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }
}

impl BatchExecutor for ScriptedExecutor {
    fn execute(&self, request: &BatchRequest<'_>) -> Result<(), ExecutorError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.calls
            .lock()
            .unwrap()
            .push((request.batch_index, request.attempt));

        let call = {
            let mut per_batch = self.calls_per_batch.lock().unwrap();
            let n = per_batch.entry(request.batch_index).or_insert(0);
            *n += 1;
            *n
        };
        let fail_first = self.failures.get(&request.batch_index).copied().unwrap_or(0);
        if call <= fail_first {
            return Err(ExecutorError::Rejected(format!(
                "scripted failure {} for batch {}",
                call, request.batch_index
            )));
        }

        let doc: Value = serde_json::from_slice(&std::fs::read(request.input).unwrap()).unwrap();
        match doc.get("inputType").and_then(Value::as_str) {
            Some("csv") => {
                let slice = doc["inputPath"].as_str().unwrap();
                std::fs::copy(slice, request.output).unwrap();
            }
            _ => {
                let query = doc["query"].as_str().unwrap_or_default();
                let mut writer = csv::Writer::from_path(request.output).unwrap();
                writer.write_record(["query", "summary"]).unwrap();
                writer.write_record([query, "ok"]).unwrap();
                writer.flush().unwrap();
            }
        }
        Ok(())
    }
}

/// Notifier that records what it would have sent.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, Notification)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, Notification)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, target: &str, notification: &Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((target.to_string(), notification.clone()));
        Ok(())
    }
}

/// Notifier that always fails delivery.
pub struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn notify(&self, target: &str, _notification: &Notification) -> Result<(), NotifyError> {
        Err(NotifyError::Status {
            url: target.to_string(),
            status: 503,
        })
    }
}
