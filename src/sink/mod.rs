//! Local durability: batching buffer and multi-destination logging

pub mod buffer;
pub mod csv_file;
pub mod file;
pub mod multi;

pub use buffer::BoundedBuffer;
pub use csv_file::{CsvSink, DEFAULT_CSV_COLUMNS};
pub use file::{FileStats, JsonLinesSink, MemorySink};
pub use multi::{LogSink, MultiSink, SinkReport};
