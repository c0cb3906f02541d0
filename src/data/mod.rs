//! Result rows and the sinks they are written to.
//!
//! Procedures describe their run once with a [`RunHeader`] and then emit one
//! [`ResultRow`] per measurement. A [`ResultSink`] decides what happens to
//! them: the CSV writer persists them, [`MemorySink`] keeps them for tests
//! and previews, [`FanOut`] forwards to several sinks at once.

pub mod storage;

pub use storage::CsvResultWriter;

use crate::error::DaqError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// One measurement: ordered `(column, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    values: Vec<(String, f64)>,
}

impl ResultRow {
    /// Empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cell.
    pub fn with(mut self, column: &str, value: f64) -> Self {
        self.values.push((column.to_string(), value));
        self
    }

    /// Value of `column`, if measured in this row.
    pub fn get(&self, column: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| *v)
    }

    /// Cells in insertion order.
    pub fn values(&self) -> &[(String, f64)] {
        &self.values
    }
}

/// Description of a run, written before the first row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunHeader {
    /// Procedure type id
    pub procedure: String,
    /// Parameter name and rendered value, in declaration order
    pub parameters: Vec<(String, String)>,
    /// Column names, in output order
    pub columns: Vec<String>,
}

/// Destination for procedure output.
#[async_trait]
pub trait ResultSink: Send {
    /// Start a run.
    async fn begin(&mut self, header: &RunHeader) -> Result<(), DaqError>;

    /// Record one row.
    async fn emit(&mut self, row: &ResultRow) -> Result<(), DaqError>;

    /// Overall progress in percent.
    async fn progress(&mut self, _percent: f64) -> Result<(), DaqError> {
        Ok(())
    }

    /// End the run and flush.
    async fn finish(&mut self) -> Result<(), DaqError>;
}

/// Everything a [`MemorySink`] has seen.
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    /// Headers in order of `begin` calls
    pub headers: Vec<RunHeader>,
    /// All rows
    pub rows: Vec<ResultRow>,
    /// All progress values
    pub progress: Vec<f64>,
    /// Number of `finish` calls
    pub finished: usize,
}

/// In-memory sink. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Recorded>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> Recorded {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Recorded) -> R) -> R {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn begin(&mut self, header: &RunHeader) -> Result<(), DaqError> {
        self.with(|r| r.headers.push(header.clone()));
        Ok(())
    }

    async fn emit(&mut self, row: &ResultRow) -> Result<(), DaqError> {
        self.with(|r| r.rows.push(row.clone()));
        Ok(())
    }

    async fn progress(&mut self, percent: f64) -> Result<(), DaqError> {
        self.with(|r| r.progress.push(percent));
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), DaqError> {
        self.with(|r| r.finished += 1);
        Ok(())
    }
}

/// Logs progress at `info` every `step_percent`.
pub struct ProgressLogger {
    step_percent: f64,
    next: f64,
    procedure: String,
}

impl ProgressLogger {
    /// Log every `step_percent` percent.
    pub fn new(step_percent: f64) -> Self {
        Self {
            step_percent: step_percent.max(1.0),
            next: 0.0,
            procedure: String::new(),
        }
    }
}

#[async_trait]
impl ResultSink for ProgressLogger {
    async fn begin(&mut self, header: &RunHeader) -> Result<(), DaqError> {
        self.procedure = header.procedure.clone();
        self.next = self.step_percent;
        tracing::info!(procedure = %self.procedure, "Run started");
        Ok(())
    }

    async fn emit(&mut self, row: &ResultRow) -> Result<(), DaqError> {
        tracing::debug!(procedure = %self.procedure, ?row, "Row");
        Ok(())
    }

    async fn progress(&mut self, percent: f64) -> Result<(), DaqError> {
        if percent >= self.next {
            tracing::info!(procedure = %self.procedure, "{:.0}% complete", percent);
            while self.next <= percent {
                self.next += self.step_percent;
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), DaqError> {
        tracing::info!(procedure = %self.procedure, "Run finished");
        Ok(())
    }
}

/// Forwards every call to each inner sink, in order.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl FanOut {
    /// No sinks yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: impl ResultSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

#[async_trait]
impl ResultSink for FanOut {
    async fn begin(&mut self, header: &RunHeader) -> Result<(), DaqError> {
        for sink in &mut self.sinks {
            sink.begin(header).await?;
        }
        Ok(())
    }

    async fn emit(&mut self, row: &ResultRow) -> Result<(), DaqError> {
        for sink in &mut self.sinks {
            sink.emit(row).await?;
        }
        Ok(())
    }

    async fn progress(&mut self, percent: f64) -> Result<(), DaqError> {
        for sink in &mut self.sinks {
            sink.progress(percent).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), DaqError> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.finish().await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
