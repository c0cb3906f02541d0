//! Procedure Sequences
//!
//! Runs one procedure file several times with different overrides:
//!
//! ```toml
//! [sequence]
//! name = "Dwell series"
//! procedure = "gate_sweep.toml"   # relative to this file
//! pause_s = 30
//!
//! [[sequence.step]]
//! dwell_time_s = 10
//!
//! [[sequence.step]]
//! "params.dwell_time_s" = 600
//! "procedure.name" = "Long dwell"
//! ```
//!
//! Every step is a separate run with its own result file. A cancelled or
//! failed step ends the sequence.

use super::config::{ConfigOverride, ConfigValue, ProcedureConfig};
use super::result::ProcedureResult;
use super::{execute_procedure_safely, CancelHandle, EmergencyStopFlag, ProcedureContext, ProcedureRegistry};
use crate::data::ResultSink;
use crate::sweep::wait_duration;
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A base procedure plus the override sets of each step.
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    pub name: String,
    pub base: ProcedureConfig,
    /// Pause between steps
    pub pause: Duration,
    pub steps: Vec<Vec<ConfigOverride>>,
}

#[derive(Debug, Deserialize)]
struct RawSequenceFile {
    sequence: RawSequence,
}

#[derive(Debug, Deserialize)]
struct RawSequence {
    #[serde(default)]
    name: String,
    procedure: PathBuf,
    #[serde(default)]
    pause_s: f64,
    #[serde(default, rename = "step")]
    steps: Vec<toml::Table>,
}

impl SequenceConfig {
    /// Load a sequence file; `procedure` is resolved against its directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sequence file {}", path.display()))?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&content, dir)
            .with_context(|| format!("Invalid sequence file {}", path.display()))
    }

    /// Parse a sequence; relative procedure paths are taken from `base_dir`.
    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self> {
        let raw: RawSequenceFile =
            toml::from_str(content).map_err(|e| anyhow!("Failed to parse sequence: {}", e))?;
        let raw = raw.sequence;

        let procedure_path = if raw.procedure.is_absolute() {
            raw.procedure
        } else {
            base_dir.join(raw.procedure)
        };
        let base = ProcedureConfig::from_file(&procedure_path)?;
        Self::from_parts(raw.name, base, raw.pause_s, raw.steps)
    }

    fn from_parts(
        name: String,
        base: ProcedureConfig,
        pause_s: f64,
        tables: Vec<toml::Table>,
    ) -> Result<Self> {
        if !(pause_s >= 0.0) {
            bail!("pause_s must not be negative, got {}", pause_s);
        }
        if tables.is_empty() {
            bail!("Sequence has no [[sequence.step]] entries");
        }

        let steps = tables
            .into_iter()
            .enumerate()
            .map(|(i, table)| {
                table
                    .into_iter()
                    .map(|(path, value)| {
                        Ok(ConfigOverride {
                            value: ConfigValue::from_toml(value)
                                .with_context(|| format!("Step {} key '{}'", i + 1, path))?,
                            path,
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let name = if name.is_empty() {
            base.procedure_type.clone()
        } else {
            name
        };
        Ok(Self {
            name,
            base,
            pause: wait_duration("pause_s", pause_s)?,
            steps,
        })
    }

    /// Configuration of step `index`, with its overrides applied.
    pub fn step_config(&self, index: usize) -> Result<ProcedureConfig> {
        let overrides = self
            .steps
            .get(index)
            .ok_or_else(|| anyhow!("Sequence has no step {}", index + 1))?;
        let mut config = self.base.clone();
        config.apply_overrides(overrides)?;
        Ok(config)
    }

    /// Every step's configuration; fails on the first bad override.
    pub fn step_configs(&self) -> Result<Vec<ProcedureConfig>> {
        (0..self.steps.len()).map(|i| self.step_config(i)).collect()
    }
}

/// What happened to each step of a sequence.
#[derive(Debug, Clone, Default)]
pub struct SequenceReport {
    pub results: Vec<ProcedureResult>,
    /// Steps never started
    pub skipped: usize,
}

impl SequenceReport {
    /// All steps ran to completion.
    pub fn is_complete(&self) -> bool {
        self.skipped == 0 && self.results.iter().all(ProcedureResult::is_success)
    }
}

/// Run the steps of `sequence` in order.
///
/// `make_sink` is called once per step with the 1-based step number. Every
/// step config is checked before the first one starts. `cancel` is shared by
/// all steps; cancelling stops the running step and skips the rest.
pub async fn run_sequence<F>(
    sequence: &SequenceConfig,
    procedures: &ProcedureRegistry,
    cancel: CancelHandle,
    emergency: EmergencyStopFlag,
    mut make_sink: F,
) -> Result<SequenceReport>
where
    F: FnMut(usize, &ProcedureConfig) -> Result<Box<dyn ResultSink>>,
{
    let configs = sequence.step_configs()?;
    let mut report = SequenceReport::default();
    let mut procs = Vec::with_capacity(configs.len());
    for (i, config) in configs.iter().enumerate() {
        let procedure = procedures
            .create_from_config(config)
            .with_context(|| format!("Step {} of '{}'", i + 1, sequence.name))?;
        procs.push(procedure);
    }

    let total = configs.len();
    for (i, (config, mut procedure)) in configs.iter().zip(procs).enumerate() {
        let step = i + 1;
        if cancel.is_cancelled() || emergency.is_triggered() {
            report.skipped = total - i;
            break;
        }
        tracing::info!(sequence = %sequence.name, "Step {}/{}: {}", step, total, config.name);

        let sink = make_sink(step, config)?;
        let execution_id = uuid::Uuid::new_v4().to_string();
        let (ctx, _progress) = ProcedureContext::new(
            execution_id.clone(),
            config.get_assignments(),
            procedures.device_registry(),
            sink,
        );
        let ctx = ctx.with_cancel_handle(cancel.clone());

        let result = match execute_procedure_safely(procedure.as_mut(), ctx, emergency.clone()).await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(sequence = %sequence.name, "Step {} failed: {:#}", step, e);
                ProcedureResult::failure(&config.procedure_type, execution_id, format!("{:#}", e))
            }
        };
        let stop = !result.is_success();
        report.results.push(result);
        if stop {
            report.skipped = total - step;
            break;
        }

        if step < total && !sequence.pause.is_zero() {
            tracing::info!("Pausing {:.0} s before the next step", sequence.pause.as_secs_f64());
            let mut rx = cancel.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(sequence.pause) => {}
                _ = rx.wait_for(|c| *c) => {}
            }
        }
    }

    tracing::info!(
        sequence = %sequence.name,
        "Sequence done: {} run, {} skipped",
        report.results.len(),
        report.skipped
    );
    Ok(report)
}
