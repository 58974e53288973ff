//! Multi-destination logging
//!
//! [`MultiSink`] hands each record to every registered [`LogSink`]. Sinks
//! fail independently: an error or panic in one is reported for that sink
//! and the others still run.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::handler::panic_message;
use crate::error::{Error, Result};
use crate::record::Record;

use super::buffer::BoundedBuffer;

/// A durable destination for records (file encoder, database, ...)
pub trait LogSink: Send + Sync {
    /// Persist one record
    fn append(&self, record: &Record) -> Result<()>;

    /// Flush buffered output. Default: nothing buffered.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Per-sink outcome of one [`MultiSink::log`] call
#[derive(Debug, Default)]
pub struct SinkReport {
    /// Success flag per sink name
    pub results: BTreeMap<String, bool>,
    /// Error text per failed sink name
    pub errors: BTreeMap<String, String>,
}

impl SinkReport {
    /// Check if every sink accepted the record
    pub fn all_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of sinks that accepted the record
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|ok| **ok).count()
    }
}

/// Fan-out over named sinks
#[derive(Default)]
pub struct MultiSink {
    sinks: RwLock<BTreeMap<String, Arc<dyn LogSink>>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink, replacing any sink with the same name
    pub fn add(&self, name: impl Into<String>, sink: impl LogSink + 'static) {
        self.add_shared(name, Arc::new(sink));
    }

    /// Register an already shared sink
    pub fn add_shared(&self, name: impl Into<String>, sink: Arc<dyn LogSink>) {
        let name = name.into();
        if self.sinks.write().insert(name.clone(), sink).is_some() {
            tracing::debug!(sink = %name, "Replaced log sink");
        }
    }

    /// Unregister a sink. Returns false if the name is unknown.
    pub fn remove(&self, name: &str) -> bool {
        self.sinks.write().remove(name).is_some()
    }

    /// Registered sink names, sorted
    pub fn names(&self) -> Vec<String> {
        self.sinks.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }

    /// Write one record to every sink.
    ///
    /// A record without a `timestamp` is stamped with the current time first.
    pub fn log(&self, record: &Record) -> SinkReport {
        let mut stamped;
        let record = if record.timestamp().is_some() {
            record
        } else {
            stamped = record.clone();
            stamped.stamp_now();
            &stamped
        };

        let mut report = SinkReport::default();
        for (name, sink) in self.snapshot() {
            match guarded_append(sink.as_ref(), record) {
                Ok(()) => {
                    report.results.insert(name, true);
                }
                Err(e) => {
                    tracing::warn!(sink = %name, error = %e, "Log sink failed");
                    report.results.insert(name.clone(), false);
                    report.errors.insert(name, e.to_string());
                }
            }
        }

        report
    }

    /// Write records in order; returns successful writes per sink
    pub fn log_batch(&self, records: &[Record]) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = self.names().into_iter().map(|name| (name, 0)).collect();

        for record in records {
            for (name, ok) in self.log(record).results {
                if ok {
                    *counts.entry(name).or_default() += 1;
                }
            }
        }

        counts
    }

    /// Drain `buffer` into every sink, then flush them
    pub fn flush(&self, buffer: &BoundedBuffer<Record>) -> BTreeMap<String, usize> {
        let records = buffer.get_all();
        let counts = self.log_batch(&records);

        for (name, sink) in self.snapshot() {
            if let Err(e) = sink.flush() {
                tracing::warn!(sink = %name, error = %e, "Log sink flush failed");
            }
        }

        tracing::debug!(records = records.len(), sinks = counts.len(), "Flushed buffer to sinks");
        counts
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn LogSink>)> {
        self.sinks
            .read()
            .iter()
            .map(|(name, sink)| (name.clone(), Arc::clone(sink)))
            .collect()
    }
}

fn guarded_append(sink: &dyn LogSink, record: &Record) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(|| sink.append(record))) {
        Ok(result) => result,
        Err(panic) => Err(Error::Sink(format!("sink panicked: {}", panic_message(&*panic)))),
    }
}
