//! Built-in log sinks

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::record::Record;

use super::multi::LogSink;

/// Size and record count of a file sink
#[derive(Debug, Clone, Serialize)]
pub struct FileStats {
    pub path: PathBuf,
    pub format: &'static str,
    pub exists: bool,
    pub size_bytes: u64,
    pub record_count: usize,
    pub last_modified: Option<DateTime<Utc>>,
}

impl FileStats {
    /// Stat `path`, counting records with `count` when the file exists
    pub(crate) fn collect(
        path: &Path,
        format: &'static str,
        count: impl FnOnce() -> Result<usize>,
    ) -> Result<Self> {
        let mut stats = FileStats {
            path: path.to_path_buf(),
            format,
            exists: false,
            size_bytes: 0,
            record_count: 0,
            last_modified: None,
        };

        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };

        stats.exists = true;
        stats.size_bytes = meta.len();
        stats.last_modified = meta.modified().ok().map(DateTime::<Utc>::from);
        stats.record_count = count()?;
        Ok(stats)
    }
}

pub(crate) fn create_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Append-only JSON-lines file, one record per line
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Open (or create) the file, creating parent directories as needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        create_parent_dirs(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!(path = %path.display(), "Opened JSON-lines sink");

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back stored records.
    ///
    /// With `limit`, only the most recent `limit` records are returned.
    /// Lines that do not parse are skipped.
    pub fn read(&self, limit: Option<usize>) -> Result<Vec<Record>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match Record::from_json(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping unreadable log line"
                ),
            }
        }

        if let Some(limit) = limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }

        Ok(records)
    }

    /// Number of stored records
    pub fn record_count(&self) -> Result<usize> {
        Ok(self.read(None)?.len())
    }

    /// Drop every stored record
    pub fn clear(&self) -> Result<()> {
        let file = self.file.lock();
        file.set_len(0)?;
        tracing::info!(path = %self.path.display(), "Cleared JSON-lines sink");
        Ok(())
    }

    pub fn stats(&self) -> Result<FileStats> {
        FileStats::collect(&self.path, "jsonl", || self.record_count())
    }
}

impl LogSink for JsonLinesSink {
    fn append(&self, record: &Record) -> Result<()> {
        let mut line = record.to_json()?;
        line.push('\n');

        let mut file = self.file.lock();
        file.write_all(line.as_bytes())
            .map_err(|e| Error::Sink(format!("{}: {}", self.path.display(), e)))
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().flush()?;
        Ok(())
    }
}

/// In-memory sink, mostly for tests and demos
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything stored
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl LogSink for MemorySink {
    fn append(&self, record: &Record) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
