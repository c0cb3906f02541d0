//! Procedure results.
//!
//! Measurement rows go to the [`ResultSink`](crate::data::ResultSink) as they
//! are produced; a [`ProcedureResult`] only summarizes how the run ended.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every setpoint was visited
    Completed,
    /// Stopped early on request; sources were zeroed
    Cancelled,
    /// Aborted by an error
    Failed,
}

/// Wall-clock timing of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTiming {
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    /// Duration predicted before the run started
    pub estimated: Option<Duration>,
}

impl ExecutionTiming {
    /// Start the clock now.
    pub fn start() -> Self {
        Self {
            started_at: Local::now(),
            finished_at: None,
            estimated: None,
        }
    }

    /// Stop the clock now.
    pub fn stop(&mut self) {
        self.finished_at = Some(Local::now());
    }

    /// Elapsed time, or zero while still running
    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .and_then(|end| (end - self.started_at).to_std().ok())
            .unwrap_or_default()
    }
}

impl Default for ExecutionTiming {
    fn default() -> Self {
        Self::start()
    }
}

/// Result of a procedure execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureResult {
    /// Procedure type that produced this result
    pub procedure_type: String,
    /// Unique execution ID
    pub execution_id: String,
    pub outcome: RunOutcome,
    /// Rows handed to the sink
    pub rows: usize,
    pub timing: ExecutionTiming,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProcedureResult {
    fn with_outcome(
        procedure_type: impl Into<String>,
        execution_id: impl Into<String>,
        outcome: RunOutcome,
    ) -> Self {
        Self {
            procedure_type: procedure_type.into(),
            execution_id: execution_id.into(),
            outcome,
            rows: 0,
            timing: ExecutionTiming::default(),
            warnings: Vec::new(),
            error: None,
        }
    }

    /// A run that visited every setpoint
    pub fn success(procedure_type: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self::with_outcome(procedure_type, execution_id, RunOutcome::Completed)
    }

    /// A run stopped on request
    pub fn cancelled(procedure_type: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self::with_outcome(procedure_type, execution_id, RunOutcome::Cancelled)
    }

    /// A run aborted by an error
    pub fn failure(
        procedure_type: impl Into<String>,
        execution_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::with_outcome(procedure_type, execution_id, RunOutcome::Failed);
        result.error = Some(error.into());
        result
    }

    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows = rows;
        self
    }

    pub fn with_timing(mut self, timing: ExecutionTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == RunOutcome::Cancelled
    }

    /// One-line human-readable summary
    pub fn summary(&self) -> String {
        match self.outcome {
            RunOutcome::Completed => format!(
                "{} - COMPLETED - {} rows in {:.1}s",
                self.procedure_type,
                self.rows,
                self.timing.elapsed().as_secs_f64()
            ),
            RunOutcome::Cancelled => format!(
                "{} - CANCELLED after {} rows ({:.1}s)",
                self.procedure_type,
                self.rows,
                self.timing.elapsed().as_secs_f64()
            ),
            RunOutcome::Failed => format!(
                "{} - FAILED - {}",
                self.procedure_type,
                self.error.as_deref().unwrap_or("Unknown error")
            ),
        }
    }
}
