//! Append-only record streams.
//!
//! Every record type goes to its own stream. A stream is opened once per test
//! case by the single task that writes it, so no locking is needed around
//! writes; each record is serialized and flushed as one whole line.

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bufbench_core::{
    BenchError, BenchResult, CapacityChangeRecord, MetricSample, RecordSink, ResizeEvent,
    ResourceSample,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Metric samples (`timestamp,test_case,phase,elapsed_seconds,tps,...`).
pub const METRIC_STREAM: &str = "tps_latency_logs.csv";
/// Resource samples (`timestamp,cpu_percent`).
pub const RESOURCE_STREAM: &str = "cpu_usage_logs.csv";
/// Resize start/end events.
pub const RESIZE_STREAM: &str = "resize_timings.csv";
/// Confirmed capacity changes.
pub const CAPACITY_STREAM: &str = "shared_buffer_sizes.csv";

/// Factory for the four record streams of a run.
pub trait OutputStreams: Send + Sync {
    fn metric_sink(&self) -> BenchResult<Box<dyn RecordSink<MetricSample>>>;
    fn resource_sink(&self) -> BenchResult<Box<dyn RecordSink<ResourceSample>>>;
    fn resize_sink(&self) -> BenchResult<Box<dyn RecordSink<ResizeEvent>>>;
    fn capacity_sink(&self) -> BenchResult<Box<dyn RecordSink<CapacityChangeRecord>>>;
}

/// CSV file appended one record per line.
///
/// The header row is written only when the file is new or empty, so test
/// cases run one after another share a single stream.
pub struct CsvSink<R> {
    writer: csv::Writer<File>,
    path: PathBuf,
    _record: PhantomData<fn(&R)>,
}

impl<R: Serialize> CsvSink<R> {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> BenchResult<Self> {
        let path = path.as_ref().to_path_buf();
        let has_rows = path.metadata().map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(!has_rows)
            .from_writer(file);

        Ok(Self {
            writer,
            path,
            _record: PhantomData,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<R: Serialize> RecordSink<R> for CsvSink<R> {
    fn append(&mut self, record: &R) -> BenchResult<()> {
        self.writer.serialize(record).map_err(|e| {
            BenchError::Sink(format!("{}: {e}", self.path.display()))
        })?;
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> BenchResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Streams written as CSV files inside one run directory.
#[derive(Debug, Clone)]
pub struct CsvOutput {
    dir: PathBuf,
}

impl CsvOutput {
    /// Uses `dir` for all streams, creating it if needed.
    pub fn create(dir: impl Into<PathBuf>) -> BenchResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn open<R: Serialize + 'static>(&self, name: &str) -> BenchResult<Box<dyn RecordSink<R>>> {
        Ok(Box::new(CsvSink::<R>::open(self.dir.join(name))?))
    }
}

impl OutputStreams for CsvOutput {
    fn metric_sink(&self) -> BenchResult<Box<dyn RecordSink<MetricSample>>> {
        self.open(METRIC_STREAM)
    }

    fn resource_sink(&self) -> BenchResult<Box<dyn RecordSink<ResourceSample>>> {
        self.open(RESOURCE_STREAM)
    }

    fn resize_sink(&self) -> BenchResult<Box<dyn RecordSink<ResizeEvent>>> {
        self.open(RESIZE_STREAM)
    }

    fn capacity_sink(&self) -> BenchResult<Box<dyn RecordSink<CapacityChangeRecord>>> {
        self.open(CAPACITY_STREAM)
    }
}

/// Reads every record of a stream back; a missing file reads as empty.
pub fn read_stream<R: DeserializeOwned>(path: impl AsRef<Path>) -> BenchResult<Vec<R>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| BenchError::Sink(format!("{}: {e}", path.display())))?;
    reader
        .deserialize()
        .collect::<Result<Vec<R>, _>>()
        .map_err(|e| BenchError::Sink(format!("{}: {e}", path.display())))
}

/// In-memory sink whose records can be inspected through a shared handle.
pub struct MemorySink<R> {
    records: Arc<Mutex<Vec<R>>>,
}

impl<R: Clone + Send> RecordSink<R> for MemorySink<R> {
    fn append(&mut self, record: &R) -> BenchResult<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Streams kept in memory, used when the caller wants the records directly.
#[derive(Clone, Default)]
pub struct MemoryOutput {
    pub metrics: Arc<Mutex<Vec<MetricSample>>>,
    pub resources: Arc<Mutex<Vec<ResourceSample>>>,
    pub resizes: Arc<Mutex<Vec<ResizeEvent>>>,
    pub capacities: Arc<Mutex<Vec<CapacityChangeRecord>>>,
}

impl MemoryOutput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sink<R: Clone + Send + 'static>(
        records: &Arc<Mutex<Vec<R>>>,
    ) -> BenchResult<Box<dyn RecordSink<R>>> {
        Ok(Box::new(MemorySink {
            records: Arc::clone(records),
        }))
    }
}

impl OutputStreams for MemoryOutput {
    fn metric_sink(&self) -> BenchResult<Box<dyn RecordSink<MetricSample>>> {
        Self::sink(&self.metrics)
    }

    fn resource_sink(&self) -> BenchResult<Box<dyn RecordSink<ResourceSample>>> {
        Self::sink(&self.resources)
    }

    fn resize_sink(&self) -> BenchResult<Box<dyn RecordSink<ResizeEvent>>> {
        Self::sink(&self.resizes)
    }

    fn capacity_sink(&self) -> BenchResult<Box<dyn RecordSink<CapacityChangeRecord>>> {
        Self::sink(&self.capacities)
    }
}
