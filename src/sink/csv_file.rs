//! Flattened-row CSV sink
//!
//! Each record becomes one row under a fixed header. Fields named by a
//! column go into that column; everything else is folded into the
//! `metadata` column as a JSON object, when the header has one.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::record::Record;

use super::file::{create_parent_dirs, FileStats};
use super::multi::LogSink;

/// Header used by [`CsvSink::open`]
pub const DEFAULT_CSV_COLUMNS: [&str; 4] = ["timestamp", "name", "value", "metadata"];

/// Column collecting fields that have no column of their own
pub const METADATA_COLUMN: &str = "metadata";

/// Append-only CSV file with a header row
pub struct CsvSink {
    path: PathBuf,
    columns: Vec<String>,
    writer: Mutex<csv::Writer<File>>,
}

impl CsvSink {
    /// Open (or create) with the default `timestamp,name,value,metadata` header
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_columns(path, DEFAULT_CSV_COLUMNS)
    }

    /// Open (or create) with a custom header.
    ///
    /// An existing non-empty file keeps the header it already has.
    pub fn open_with_columns<I, S>(path: impl AsRef<Path>, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path = path.as_ref().to_path_buf();
        create_parent_dirs(&path)?;

        let existing = existing_header(&path)?;
        let write_header = existing.is_none();
        let columns: Vec<String> =
            existing.unwrap_or_else(|| columns.into_iter().map(Into::into).collect());
        if columns.is_empty() {
            return Err(Error::InvalidValue("CSV sink needs at least one column".into()));
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if write_header {
            writer.write_record(&columns)?;
            writer.flush()?;
        }

        tracing::debug!(path = %path.display(), columns = columns.len(), "Opened CSV sink");

        Ok(Self {
            path,
            columns,
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Flatten a record into one row of cells
    fn row(&self, record: &Record) -> Result<Vec<String>> {
        let extra: Map<String, Value> = record
            .iter()
            .filter(|(key, _)| !self.columns.iter().any(|c| c == *key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        self.columns
            .iter()
            .map(|column| -> Result<String> {
                if column != METADATA_COLUMN {
                    return Ok(record.get(column).map(cell).unwrap_or_default());
                }

                let mut metadata = match record.get(METADATA_COLUMN) {
                    Some(Value::Object(own)) => own.clone(),
                    Some(other) if extra.is_empty() => return Ok(cell(other)),
                    _ => Map::new(),
                };
                metadata.extend(extra.clone());

                if metadata.is_empty() {
                    Ok(String::new())
                } else {
                    Ok(serde_json::to_string(&metadata)?)
                }
            })
            .collect()
    }

    /// Read back stored rows as records.
    ///
    /// Numeric and boolean cells come back typed; the metadata column is
    /// expanded into top-level fields. With `limit`, only the most recent
    /// `limit` rows are returned.
    pub fn read(&self, limit: Option<usize>) -> Result<Vec<Record>> {
        self.writer.lock().flush()?;

        let mut reader = csv::Reader::from_path(&self.path)?;
        let headers = reader.headers()?.clone();
        let mut records = Vec::new();

        for row in reader.records() {
            let row = row?;
            let mut record = Record::new();

            for (column, value) in headers.iter().zip(row.iter()) {
                if value.is_empty() {
                    continue;
                }
                if column == METADATA_COLUMN {
                    match serde_json::from_str::<Map<String, Value>>(value) {
                        Ok(fields) => {
                            for (key, field) in fields {
                                record.insert(key, field);
                            }
                        }
                        Err(_) => {
                            record.insert(column, value);
                        }
                    }
                } else {
                    record.insert(column, parse_cell(value));
                }
            }

            records.push(record);
        }

        if let Some(limit) = limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }

        Ok(records)
    }

    /// Number of stored rows (header excluded)
    pub fn record_count(&self) -> Result<usize> {
        self.writer.lock().flush()?;

        let mut reader = csv::Reader::from_path(&self.path)?;
        let mut count = 0;
        for row in reader.records() {
            row?;
            count += 1;
        }
        Ok(count)
    }

    /// Drop every stored row, keeping the header
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        File::create(&self.path)?;
        writer.write_record(&self.columns)?;
        writer.flush()?;

        tracing::info!(path = %self.path.display(), "Cleared CSV sink");
        Ok(())
    }

    pub fn stats(&self) -> Result<FileStats> {
        self.writer.lock().flush()?;
        FileStats::collect(&self.path, "csv", || self.record_count())
    }
}

impl LogSink for CsvSink {
    fn append(&self, record: &Record) -> Result<()> {
        let row = self.row(record)?;

        let mut writer = self.writer.lock();
        writer
            .write_record(&row)
            .map_err(|e| Error::Sink(format!("{}: {}", self.path.display(), e)))
    }

    fn flush(&self) -> Result<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

/// Header of an existing non-empty file
fn existing_header(path: &Path) -> Result<Option<Vec<String>>> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => {}
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut reader = csv::Reader::from_path(path)?;
    let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    Ok(Some(header))
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_cell(text: &str) -> Value {
    if let Ok(n) = text.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(x) = text.parse::<f64>() {
        if x.is_finite() {
            return Value::from(x);
        }
    }
    match text {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(text.to_string()),
    }
}
