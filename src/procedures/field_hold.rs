//! Constant-field hold.
//!
//! Keeps the coil at `field_current_a` for `duration_s` seconds, re-applying
//! the setpoint and reading it back once per second, then returns the coil to
//! zero. Currents at or above `max_field_current_a` are refused before
//! anything but a zero is written to the supply.

use super::hall_sweep::FIELD_CURRENT_COLUMN;
use super::panic_safety::SafeShutdown;
use super::result::ExecutionTiming;
use super::{
    ParameterDef, PreviewLeg, Procedure, ProcedureConfig, ProcedureContext, ProcedureProgress,
    ProcedureResult, ProcedureState, ProcedureTypeInfo, RoleRequirement, RunProgress,
};
use crate::data::{ResultRow, RunHeader};
use crate::error::DaqError;
use crate::hardware::capabilities::{CurrentMeter, CurrentSource};
use crate::sweep::{wait_duration, Estimate};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub const TIME_COLUMN: &str = "Time (s)";

/// Coil supply limit of the Kepco BOP setup.
pub const DEFAULT_MAX_FIELD_CURRENT_A: f64 = 29.0;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

struct Coil {
    source: Arc<dyn CurrentSource>,
    meter: Arc<dyn CurrentMeter>,
}

impl Coil {
    async fn zero(&self) {
        if let Err(e) = self.source.set_current(0.0).await {
            tracing::error!("Failed to zero the coil: {}", e);
        }
    }
}

/// Constant coil current procedure
pub struct FieldHoldProcedure {
    config: ProcedureConfig,
    field_current_a: f64,
    duration_s: f64,
    max_field_current_a: f64,
    state: ProcedureState,
    progress: ProcedureProgress,
    coil: Option<Coil>,
    safe: SafeShutdown,
}

impl Default for FieldHoldProcedure {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldHoldProcedure {
    pub fn new() -> Self {
        Self {
            config: ProcedureConfig::new("field_hold"),
            field_current_a: 0.0,
            duration_s: 10.0,
            max_field_current_a: DEFAULT_MAX_FIELD_CURRENT_A,
            state: ProcedureState::Idle,
            progress: ProcedureProgress::default(),
            coil: None,
            safe: SafeShutdown::new(),
        }
    }

    /// One sample per started second.
    fn samples(&self) -> usize {
        self.duration_s.max(0.0).ceil() as usize
    }

    async fn hold(&self, coil: &Coil, ctx: &ProcedureContext, progress: &mut RunProgress) -> Result<bool> {
        if self.field_current_a.abs() >= self.max_field_current_a {
            coil.zero().await;
            return Err(DaqError::SafetyLimit(format!(
                "field current {} A is at or above the {} A limit",
                self.field_current_a, self.max_field_current_a
            ))
            .into());
        }

        tracing::info!(
            "Holding coil at {} A for {} s",
            self.field_current_a,
            self.duration_s
        );
        for second in 0..self.samples() {
            if let Err(e) = coil.source.set_current(self.field_current_a).await {
                coil.zero().await;
                return Err(e);
            }
            let measured = coil.meter.measure_current().await?;
            let row = ResultRow::new()
                .with(TIME_COLUMN, second as f64)
                .with(FIELD_CURRENT_COLUMN, measured);
            progress.record(ctx, row, "hold").await?;

            if ctx.sleep(SAMPLE_INTERVAL).await {
                tracing::warn!("Catch stop command after {} s", second + 1);
                coil.zero().await;
                return Ok(false);
            }
        }

        coil.source.set_current(0.0).await?;
        tracing::info!("Field hold finished");
        Ok(true)
    }
}

#[async_trait]
impl Procedure for FieldHoldProcedure {
    fn type_info() -> ProcedureTypeInfo {
        ProcedureTypeInfo {
            type_id: "field_hold".to_string(),
            name: "Constant Field".to_string(),
            description: "Hold the magnet coil at a fixed current".to_string(),
            category: "magnet".to_string(),
            roles: vec![RoleRequirement::required(
                "field_supply",
                "CurrentSource",
                "Magnet coil supply with current readback",
            )],
            parameters: vec![
                ParameterDef::float("field_current_a", 0.0, "A", "Coil current to hold"),
                ParameterDef::float("duration_s", 10.0, "s", "Hold time").at_least(0.0),
                ParameterDef::float(
                    "max_field_current_a",
                    DEFAULT_MAX_FIELD_CURRENT_A,
                    "A",
                    "Currents at or above this are refused",
                )
                .at_least(0.0),
            ],
            version: "1.0.0".to_string(),
        }
    }

    fn type_id(&self) -> &str {
        "field_hold"
    }

    fn state(&self) -> ProcedureState {
        self.state
    }

    fn progress(&self) -> ProcedureProgress {
        self.progress.clone()
    }

    fn configure(&mut self, config: &ProcedureConfig) -> Result<Vec<String>> {
        let warnings = config.validate(&Self::type_info())?;
        self.field_current_a = config.f64_or("field_current_a", 0.0)?;
        self.duration_s = config.f64_or("duration_s", 10.0)?;
        self.max_field_current_a =
            config.f64_or("max_field_current_a", DEFAULT_MAX_FIELD_CURRENT_A)?;
        for (name, value) in [
            ("field_current_a", self.field_current_a),
            ("max_field_current_a", self.max_field_current_a),
        ] {
            if !value.is_finite() {
                return Err(anyhow!("{} must be a finite number, got {}", name, value));
            }
        }
        wait_duration("duration_s", self.duration_s)?;
        self.config = config.clone();
        Ok(warnings)
    }

    fn get_config(&self) -> &ProcedureConfig {
        &self.config
    }

    fn estimate(&self) -> Result<Estimate> {
        Ok(Estimate::from_secs_f64(
            self.samples() as f64 * SAMPLE_INTERVAL.as_secs_f64(),
        )?)
    }

    fn preview(&self) -> Vec<PreviewLeg> {
        vec![PreviewLeg {
            label: "hold".into(),
            unit: "A",
            values: vec![self.field_current_a; self.samples()],
        }]
    }

    fn header(&self) -> RunHeader {
        RunHeader {
            procedure: "field_hold".to_string(),
            parameters: self.config.effective_parameters(&Self::type_info()),
            columns: vec![TIME_COLUMN.to_string(), FIELD_CURRENT_COLUMN.to_string()],
        }
    }

    async fn validate(&mut self, ctx: &ProcedureContext) -> Result<Vec<String>> {
        self.state = ProcedureState::Validating;
        let source = ctx.get_current_source("field_supply").await?;
        let meter = ctx.get_current_meter("field_supply").await?;
        self.safe
            .register("field_supply", ctx.get_output("field_supply").await?);
        self.coil = Some(Coil { source, meter });

        let mut warnings = Vec::new();
        if self.samples() == 0 {
            warnings.push("duration_s is 0; the coil will not be driven".to_string());
        }
        Ok(warnings)
    }

    async fn prepare(&mut self, ctx: &ProcedureContext) -> Result<()> {
        self.state = ProcedureState::Preparing;
        ctx.get_output("field_supply").await?.enable_output().await
    }

    async fn execute(&mut self, ctx: ProcedureContext) -> Result<ProcedureResult> {
        let coil = self
            .coil
            .as_ref()
            .ok_or_else(|| anyhow!("field_hold executed before validation"))?;
        let total = self.samples();
        let mut timing = ExecutionTiming::start();
        let mut progress = RunProgress::new(total);
        self.state = ProcedureState::Running;

        let completed = match self.hold(coil, &ctx, &mut progress).await {
            Ok(completed) => completed,
            Err(e) => {
                self.state = ProcedureState::Failed;
                return Err(e);
            }
        };
        timing.stop();

        self.state = if completed {
            ProcedureState::Completed
        } else {
            ProcedureState::Cancelled
        };
        self.progress = ProcedureProgress {
            state: self.state,
            current_step: progress.rows(),
            total_steps: total,
            step_name: "hold".to_string(),
            overall_progress: progress.percent(),
            message: None,
        };

        let result = if completed {
            ProcedureResult::success("field_hold", &ctx.procedure_id)
        } else {
            ProcedureResult::cancelled("field_hold", &ctx.procedure_id)
        };
        Ok(result.with_rows(progress.rows()).with_timing(timing))
    }

    async fn finalize(&mut self, _ctx: &ProcedureContext) -> Result<()> {
        let failed = self.safe.run_all().await;
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("Could not shut down: {}", failed.join(", ")))
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        self.state = ProcedureState::Cancelled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedures::testing::{assert_progress_complete, Bench};
    use crate::procedures::{execute_procedure_safely, EmergencyStopFlag};

    fn hold_config(amps: f64, seconds: f64) -> ProcedureConfig {
        ProcedureConfig::new("field_hold")
            .with_param("field_current_a", amps)
            .with_param("duration_s", seconds)
            .with_role("field_supply", "coil")
    }

    #[test]
    fn test_configure_rejects_non_finite_values() {
        let mut procedure = FieldHoldProcedure::new();
        assert!(procedure.configure(&hold_config(3.0, f64::INFINITY)).is_err());
        assert!(procedure.configure(&hold_config(f64::NAN, 5.0)).is_err());
        assert!(procedure.configure(&hold_config(3.0, 5.0)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_samples_once_per_second() {
        let bench = Bench::new();
        let config = hold_config(3.0, 5.0);
        let mut procedure = FieldHoldProcedure::new();
        procedure.configure(&config).unwrap();
        assert!((procedure.estimate().unwrap().duration.as_secs_f64() - 5.0).abs() < 1e-9);
        let (ctx, sink) = bench.context(&config);

        let started = tokio::time::Instant::now();
        let result = execute_procedure_safely(&mut procedure, ctx, EmergencyStopFlag::new())
            .await
            .unwrap();
        assert!(result.is_success());
        assert!(started.elapsed() >= Duration::from_secs(5));

        let recorded = sink.snapshot();
        assert_eq!(recorded.rows.len(), 5);
        assert_eq!(recorded.rows[4].get(TIME_COLUMN), Some(4.0));
        assert!(recorded
            .rows
            .iter()
            .all(|r| r.get(FIELD_CURRENT_COLUMN) == Some(3.0)));
        assert_progress_complete(&recorded.progress);

        assert_eq!(bench.coil.level(), 0.0);
        assert!(!bench.coil.is_output_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refuses_current_at_limit() {
        let bench = Bench::new();
        let config = hold_config(29.0, 5.0);
        let mut procedure = FieldHoldProcedure::new();
        procedure.configure(&config).unwrap();
        let (ctx, sink) = bench.context(&config);

        let err = execute_procedure_safely(&mut procedure, ctx, EmergencyStopFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::SafetyLimit(_))
        ));
        assert!(sink.snapshot().rows.is_empty());
        assert!(bench.coil.setpoints().iter().all(|&a| a == 0.0));
        assert_eq!(procedure.state(), ProcedureState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_zeroes_coil() {
        let bench = Bench::new();
        let config = hold_config(-2.0, 600.0);
        let mut procedure = FieldHoldProcedure::new();
        procedure.configure(&config).unwrap();
        let (ctx, sink) = bench.context(&config);
        let handle = ctx.cancel_handle();

        let run = tokio::spawn(async move {
            execute_procedure_safely(&mut procedure, ctx, EmergencyStopFlag::new()).await
        });
        tokio::time::sleep(Duration::from_millis(3500)).await;
        handle.cancel();

        let result = run.await.unwrap().unwrap();
        assert!(result.is_cancelled());
        assert_eq!(sink.snapshot().rows.len(), 4);
        assert_eq!(bench.coil.level(), 0.0);
    }
}
