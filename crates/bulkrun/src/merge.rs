//! Concatenates finished batch outputs into the job's final artifact.
//!
//! Outputs are CSV. Rows keep batch order; the header is the union of all
//! batch headers in first-seen order, and a batch missing a column gets empty
//! cells. A header naming the same column twice keeps both columns. Outputs
//! that are missing or empty, that fail to parse, or that hold a record wider
//! than their header are skipped and reported, never fatal. The artifact appears atomically via rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use csv::StringRecord;

use crate::error::MergeError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Data rows written to the artifact.
    pub rows: usize,
    /// Outputs that made it into the artifact, in order.
    pub merged: Vec<PathBuf>,
    /// Outputs that could not be used.
    pub skipped: Vec<PathBuf>,
}

struct BatchTable {
    path: PathBuf,
    /// Column key per header position, see [`column_keys`].
    keys: Vec<ColumnKey>,
    records: Vec<StringRecord>,
}

/// A header name plus how many columns of that name came before it in the
/// same header, so `name,name` stays two columns.
type ColumnKey = (String, usize);

#[derive(Debug, thiserror::Error)]
enum TableError {
    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("record on line {line} has {fields} fields but the header has {columns}")]
    Ragged {
        line: u64,
        fields: usize,
        columns: usize,
    },
}

fn column_keys(headers: &StringRecord) -> Vec<ColumnKey> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    headers
        .iter()
        .map(|name| {
            let occurrence = seen.entry(name).or_insert(0);
            let key = (name.to_string(), *occurrence);
            *occurrence += 1;
            key
        })
        .collect()
}

fn read_table(path: &Path) -> Result<Option<BatchTable>, TableError> {
    let is_empty = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    if is_empty {
        return Ok(None);
    }
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let mut records = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.len() > headers.len() {
            return Err(TableError::Ragged {
                line: record.position().map_or(0, |p| p.line()),
                fields: record.len(),
                columns: headers.len(),
            });
        }
        records.push(record);
    }
    Ok(Some(BatchTable {
        path: path.to_path_buf(),
        keys: column_keys(&headers),
        records,
    }))
}

/// Merges `outputs` (in batch order) into `artifact`.
pub fn merge_csv(outputs: &[PathBuf], artifact: &Path) -> Result<MergeOutcome, MergeError> {
    let mut outcome = MergeOutcome::default();
    let mut tables = Vec::with_capacity(outputs.len());

    for path in outputs {
        match read_table(path) {
            Ok(Some(table)) => tables.push(table),
            Ok(None) => {
                tracing::warn!(output = %crate::sanitize::redact_path(path), "Skipping empty or missing batch output");
                outcome.skipped.push(path.clone());
            }
            Err(e) => {
                tracing::warn!(output = %crate::sanitize::redact_path(path), error = %e, "Skipping unreadable batch output");
                outcome.skipped.push(path.clone());
            }
        }
    }

    let mut columns: Vec<String> = Vec::new();
    let mut position: HashMap<ColumnKey, usize> = HashMap::new();
    for table in &tables {
        for key in &table.keys {
            if !position.contains_key(key) {
                position.insert(key.clone(), columns.len());
                columns.push(key.0.clone());
            }
        }
    }

    if let Some(parent) = artifact.parent() {
        std::fs::create_dir_all(parent).map_err(|e| MergeError::WriteArtifact {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let tmp = artifact.with_extension("csv.tmp");
    let csv_err = |e: csv::Error| MergeError::Csv {
        path: tmp.clone(),
        source: e,
    };

    let mut writer = csv::Writer::from_path(&tmp).map_err(csv_err)?;
    if !columns.is_empty() {
        writer.write_record(&columns).map_err(csv_err)?;
    }

    let mut row = vec![String::new(); columns.len()];
    for table in tables {
        let slots: Vec<usize> = table.keys.iter().map(|key| position[key]).collect();
        for record in &table.records {
            row.iter_mut().for_each(String::clear);
            for (slot, value) in slots.iter().zip(record.iter()) {
                row[*slot] = value.to_string();
            }
            writer.write_record(&row).map_err(csv_err)?;
            outcome.rows += 1;
        }
        outcome.merged.push(table.path);
    }

    writer.flush().map_err(|e| MergeError::WriteArtifact {
        path: tmp.clone(),
        source: e,
    })?;
    drop(writer);

    std::fs::rename(&tmp, artifact).map_err(|e| MergeError::WriteArtifact {
        path: artifact.to_path_buf(),
        source: e,
    })?;

    Ok(outcome)
}
