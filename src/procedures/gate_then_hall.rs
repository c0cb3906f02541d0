//! Gate sweep followed by an anomalous Hall loop.
//!
//! The gate source is zeroed and switched off after its sweep; after
//! `interval_s` the Hall loop runs. Both phases share one result file and one
//! progress bar. Gate rows leave the Hall columns empty and vice versa.
//!
//! # Configuration
//!
//! ```toml
//! [procedure]
//! type = "gate_then_hall"
//!
//! [params]
//! max_voltage_mv = 2000
//! min_voltage_mv = 0
//! interval_s = 8.0
//! field_current_a = 4.0
//!
//! [roles.source]
//! device_id = "gate_psu"
//!
//! [roles.field_supply]
//! device_id = "kepco"
//!
//! [roles.hall_meter]
//! device_id = "hall_smu"
//! ```

use super::gate_sweep::{run_gate_sweep, GateDevices, GateSweepParams, GATE_COLUMNS};
use super::hall_sweep::{run_hall_sweep, HallDevices, HallSweepParams, HALL_COLUMNS};
use super::panic_safety::SafeShutdown;
use super::result::ExecutionTiming;
use super::{
    ParameterDef, PreviewLeg, Procedure, ProcedureConfig, ProcedureContext, ProcedureProgress,
    ProcedureResult, ProcedureState, ProcedureTypeInfo, RoleRequirement, RunProgress,
};
use crate::data::RunHeader;
use crate::sweep::{wait_duration, Estimate};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

const DEFAULT_INTERVAL_S: f64 = 8.0;

struct Devices {
    gate: GateDevices,
    hall: HallDevices,
}

/// Combined gate + Hall procedure
pub struct GateThenHallProcedure {
    config: ProcedureConfig,
    gate: GateSweepParams,
    hall: HallSweepParams,
    interval_s: f64,
    state: ProcedureState,
    progress: ProcedureProgress,
    devices: Option<Devices>,
    safe: SafeShutdown,
}

impl Default for GateThenHallProcedure {
    fn default() -> Self {
        Self::new()
    }
}

impl GateThenHallProcedure {
    pub fn new() -> Self {
        Self {
            config: ProcedureConfig::new("gate_then_hall"),
            gate: GateSweepParams::default(),
            hall: HallSweepParams::default(),
            interval_s: DEFAULT_INTERVAL_S,
            state: ProcedureState::Idle,
            progress: ProcedureProgress::default(),
            devices: None,
            safe: SafeShutdown::new(),
        }
    }

    fn interval(&self) -> Result<Duration> {
        Ok(wait_duration("interval_s", self.interval_s)?)
    }

    fn total_samples(&self) -> usize {
        let gate = self.gate.sweep().map(|s| s.len()).unwrap_or(0);
        gate + self.hall.field_loop().len()
    }

    async fn run(&self, devices: &Devices, ctx: &ProcedureContext, progress: &mut RunProgress) -> Result<bool> {
        let sweep = self.gate.sweep()?;
        if !run_gate_sweep(&devices.gate, &self.gate, &sweep, ctx, progress).await? {
            devices.hall.stop().await;
            return Ok(false);
        }

        devices.gate.stop().await;
        tracing::info!(
            "E-field application finished, AHE measurement starts in {} s",
            self.interval_s
        );
        if ctx.sleep(self.interval()?).await {
            tracing::warn!("Catch stop command during interval");
            devices.hall.stop().await;
            return Ok(false);
        }

        run_hall_sweep(&devices.hall, &self.hall, ctx, progress).await
    }
}

#[async_trait]
impl Procedure for GateThenHallProcedure {
    fn type_info() -> ProcedureTypeInfo {
        let mut parameters = GateSweepParams::parameter_defs();
        parameters.push(
            ParameterDef::float(
                "interval_s",
                DEFAULT_INTERVAL_S,
                "s",
                "Pause between the gate sweep and the Hall loop",
            )
            .at_least(0.0),
        );
        parameters.extend(HallSweepParams::parameter_defs());

        ProcedureTypeInfo {
            type_id: "gate_then_hall".to_string(),
            name: "Gate Sweep then Hall Loop".to_string(),
            description: "Apply the E-field sweep, wait, then measure the anomalous Hall loop"
                .to_string(),
            category: "transport".to_string(),
            roles: vec![
                RoleRequirement::required("source", "VoltageSource", "Gate voltage source"),
                RoleRequirement::optional(
                    "meter",
                    "CurrentMeter",
                    "Gate leakage meter (defaults to the source)",
                ),
                RoleRequirement::required(
                    "field_supply",
                    "CurrentSource",
                    "Magnet coil supply with current readback",
                ),
                RoleRequirement::required(
                    "hall_meter",
                    "CurrentSource",
                    "SMU sourcing the bias and measuring the Hall voltage",
                ),
            ],
            parameters,
            version: "1.0.0".to_string(),
        }
    }

    fn type_id(&self) -> &str {
        "gate_then_hall"
    }

    fn state(&self) -> ProcedureState {
        self.state
    }

    fn progress(&self) -> ProcedureProgress {
        self.progress.clone()
    }

    fn configure(&mut self, config: &ProcedureConfig) -> Result<Vec<String>> {
        let warnings = config.validate(&Self::type_info())?;
        self.gate = GateSweepParams::from_procedure_config(config)?;
        self.hall = HallSweepParams::from_procedure_config(config)?;
        self.interval_s = config.f64_or("interval_s", DEFAULT_INTERVAL_S)?;
        self.interval()?;
        self.config = config.clone();
        Ok(warnings)
    }

    fn get_config(&self) -> &ProcedureConfig {
        &self.config
    }

    fn estimate(&self) -> Result<Estimate> {
        Ok(Estimate::from_secs_f64(
            self.gate.estimated_secs() + self.interval_s + self.hall.estimated_secs(),
        )?)
    }

    fn preview(&self) -> Vec<PreviewLeg> {
        let mut legs = self.gate.preview_legs();
        legs.push(PreviewLeg {
            label: "field loop".into(),
            unit: "A",
            values: self.hall.field_loop(),
        });
        legs
    }

    fn header(&self) -> RunHeader {
        RunHeader {
            procedure: "gate_then_hall".to_string(),
            parameters: self.config.effective_parameters(&Self::type_info()),
            columns: GATE_COLUMNS
                .iter()
                .chain(HALL_COLUMNS.iter())
                .map(|c| c.to_string())
                .collect(),
        }
    }

    async fn validate(&mut self, ctx: &ProcedureContext) -> Result<Vec<String>> {
        self.state = ProcedureState::Validating;
        let gate = GateDevices::resolve(ctx, &mut self.safe).await?;
        let hall = HallDevices::resolve(ctx, &mut self.safe).await?;
        self.devices = Some(Devices { gate, hall });

        let mut warnings = Vec::new();
        if ctx.get_device_id("source") == ctx.get_device_id("hall_meter") {
            warnings.push("Gate source and Hall SMU are the same device".to_string());
        }
        Ok(warnings)
    }

    async fn prepare(&mut self, ctx: &ProcedureContext) -> Result<()> {
        self.state = ProcedureState::Preparing;
        let devices = self
            .devices
            .as_ref()
            .ok_or_else(|| anyhow!("gate_then_hall prepared before validation"))?;
        devices.gate.configure(ctx, &self.gate).await?;
        devices.hall.configure(ctx, &self.hall).await
    }

    async fn execute(&mut self, ctx: ProcedureContext) -> Result<ProcedureResult> {
        let devices = self
            .devices
            .as_ref()
            .ok_or_else(|| anyhow!("gate_then_hall executed before validation"))?;
        let total = self.total_samples();
        let mut timing = ExecutionTiming::start();
        let mut progress = RunProgress::new(total);
        self.state = ProcedureState::Running;

        let completed = match self.run(devices, &ctx, &mut progress).await {
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
            step_name: "done".to_string(),
            overall_progress: progress.percent(),
            message: None,
        };

        let result = if completed {
            ProcedureResult::success("gate_then_hall", &ctx.procedure_id)
        } else {
            ProcedureResult::cancelled("gate_then_hall", &ctx.procedure_id)
        };
        Ok(result.with_rows(progress.rows()).with_timing(timing))
    }

    async fn finalize(&mut self, _ctx: &ProcedureContext) -> Result<()> {
        let failed = self.safe.run_all().await;
        tracing::info!("Finished");
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
    use crate::procedures::gate_sweep::VOLTAGE_COLUMN;
    use crate::procedures::hall_sweep::FIELD_CURRENT_COLUMN;
    use crate::procedures::testing::{assert_progress_complete, Bench};
    use crate::procedures::{execute_procedure_safely, EmergencyStopFlag};
    use tracing_test::traced_test;

    fn small_config() -> ProcedureConfig {
        ProcedureConfig::new("gate_then_hall")
            .with_param("max_voltage_mv", 100i32)
            .with_param("min_voltage_mv", 0i32)
            .with_param("voltage_step_mv", 50i32)
            .with_param("delay_ms", 10i32)
            .with_param("dwell_time_s", 1i32)
            .with_param("interval_s", 8i32)
            .with_param("field_current_a", 2.0f64)
            .with_param("field_step_a", 0.5f64)
            .with_param("waiting_time_s", 0.01f64)
            .with_role("source", "gate")
            .with_role("field_supply", "coil")
            .with_role("hall_meter", "smu")
    }

    #[test]
    fn test_estimate_sums_phases() {
        let procedure = GateThenHallProcedure::new();
        // 70 s gate + 8 s interval + 40 s Hall with defaults
        let secs = procedure.estimate().unwrap().duration.as_secs_f64();
        assert!((secs - 118.0).abs() < 1e-6);
    }

    #[test]
    fn test_configure_rejects_endless_interval() {
        let mut procedure = GateThenHallProcedure::new();
        for interval in [f64::INFINITY, 1e9] {
            let config = small_config().with_param("interval_s", interval);
            assert!(procedure.configure(&config).is_err());
        }
        let runaway = small_config().with_param("field_step_a", 1e-300f64);
        assert!(procedure.configure(&runaway).is_err());
    }

    #[test]
    fn test_header_has_union_of_columns() {
        let procedure = GateThenHallProcedure::new();
        assert_eq!(procedure.header().columns.len(), 5);
    }

    #[test]
    fn test_preview_has_four_legs() {
        let mut procedure = GateThenHallProcedure::new();
        procedure.configure(&small_config()).unwrap();
        let legs = procedure.preview();
        assert_eq!(legs.len(), 4);
        assert_eq!(legs[3].values.len(), 21);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_gate_then_hall_single_run() {
        let bench = Bench::new();
        let config = small_config();
        let mut procedure = GateThenHallProcedure::new();
        procedure.configure(&config).unwrap();
        let (ctx, sink) = bench.context(&config);

        let started = tokio::time::Instant::now();
        let result = execute_procedure_safely(&mut procedure, ctx, EmergencyStopFlag::new())
            .await
            .unwrap();
        assert!(result.is_success());

        // Gate: approach 0, 0.05; dwell 2; return 0.1, 0.05, 0.
        let recorded = sink.snapshot();
        assert_eq!(recorded.rows.len(), 7 + 21);
        assert_eq!(recorded.headers.len(), 1);
        assert_progress_complete(&recorded.progress);

        assert!(recorded.rows[0].get(VOLTAGE_COLUMN).is_some());
        assert!(recorded.rows[0].get(FIELD_CURRENT_COLUMN).is_none());
        assert!(recorded.rows[7].get(VOLTAGE_COLUMN).is_none());
        assert!(recorded.rows[7].get(FIELD_CURRENT_COLUMN).is_some());

        assert!(started.elapsed() >= Duration::from_secs(8));
        assert!(logs_contain("E-field application finished"));
        assert!(logs_contain("AHE Measurement finished"));
        assert!(!bench.gate.is_output_enabled());
        assert!(!bench.smu.is_output_enabled());
        assert_eq!(bench.coil.level(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_interval_skips_hall() {
        let bench = Bench::new();
        let config = small_config().with_param("interval_s", 600i32);
        let mut procedure = GateThenHallProcedure::new();
        procedure.configure(&config).unwrap();
        let (ctx, sink) = bench.context(&config);
        let handle = ctx.cancel_handle();

        let run = tokio::spawn(async move {
            execute_procedure_safely(&mut procedure, ctx, EmergencyStopFlag::new()).await
        });
        tokio::time::sleep(Duration::from_secs(60)).await;
        handle.cancel();

        let result = run.await.unwrap().unwrap();
        assert!(result.is_cancelled());
        assert_eq!(sink.snapshot().rows.len(), 7);
        // Only the zeroing setpoints reached the coil.
        assert!(bench.coil.setpoints().iter().all(|&a| a == 0.0));
    }
}
