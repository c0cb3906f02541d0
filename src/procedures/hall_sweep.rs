//! Anomalous Hall Effect Procedure
//!
//! Drives a constant bias current through the sample and ramps the magnet
//! coil through a full hysteresis loop, `0 → +B → -B → +B`, recording the
//! measured coil current against the Hall voltage.
//!
//! The Hall voltage is read 4-wire unless `four_wire = false`; terminals
//! and NPLC stay settings of the SMU's driver.
//!
//! # Configuration
//!
//! ```toml
//! [procedure]
//! type = "hall_sweep"
//!
//! [params]
//! field_current_a = 4.0
//! field_step_a = 0.1
//! waiting_time_s = 0.2
//! bias_current_a = 0.0004
//! compliance_voltage_v = 5.0
//! four_wire = true
//!
//! [roles.field_supply]
//! device_id = "kepco"
//!
//! [roles.hall_meter]
//! device_id = "hall_smu"
//! ```

use super::gate_sweep::SETTLE_TIME;
use super::panic_safety::SafeShutdown;
use super::result::ExecutionTiming;
use super::{
    ParameterDef, PreviewLeg, Procedure, ProcedureConfig, ProcedureContext, ProcedureProgress,
    ProcedureResult, ProcedureState, ProcedureTypeInfo, RoleRequirement, RunProgress,
};
use crate::data::{ResultRow, RunHeader};
use crate::hardware::capabilities::{CurrentMeter, CurrentSource, OutputControl, VoltageMeter};
use crate::sweep::{check_point_count, hysteresis_loop, wait_duration, Estimate};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const FIELD_CURRENT_COLUMN: &str = "FieldCurrent (A)";
pub const HALL_VOLTAGE_COLUMN: &str = "Hall Voltage (V)";

/// Columns of a Hall row, in output order.
pub const HALL_COLUMNS: [&str; 2] = [FIELD_CURRENT_COLUMN, HALL_VOLTAGE_COLUMN];

// =============================================================================
// Configuration
// =============================================================================

/// Typed Hall-loop parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HallSweepParams {
    /// Loop amplitude B (coil current)
    pub field_current_a: f64,
    /// Loop step S
    pub field_step_a: f64,
    /// Pause after each field point
    pub waiting_time_s: f64,
    pub bias_current_a: f64,
    pub compliance_voltage_v: f64,
    /// Remote sense on the Hall voltage
    pub four_wire: bool,
}

impl Default for HallSweepParams {
    fn default() -> Self {
        Self {
            field_current_a: 4.0,
            field_step_a: 0.1,
            waiting_time_s: 0.2,
            bias_current_a: 400e-6,
            compliance_voltage_v: 5.0,
            four_wire: true,
        }
    }
}

impl HallSweepParams {
    pub fn from_procedure_config(config: &ProcedureConfig) -> Result<Self> {
        let d = Self::default();
        let params = Self {
            field_current_a: config.f64_or("field_current_a", d.field_current_a)?,
            field_step_a: config.f64_or("field_step_a", d.field_step_a)?,
            waiting_time_s: config.f64_or("waiting_time_s", d.waiting_time_s)?,
            bias_current_a: config.f64_or("bias_current_a", d.bias_current_a)?,
            compliance_voltage_v: config
                .f64_or("compliance_voltage_v", d.compliance_voltage_v)?,
            four_wire: config.bool_or("four_wire", d.four_wire)?,
        };
        for (name, value) in [
            ("field_current_a", params.field_current_a),
            ("field_step_a", params.field_step_a),
            ("bias_current_a", params.bias_current_a),
            ("compliance_voltage_v", params.compliance_voltage_v),
        ] {
            if !value.is_finite() {
                return Err(anyhow!("{} must be a finite number, got {}", name, value));
            }
        }
        if !(params.field_current_a > 0.0) {
            return Err(anyhow!(
                "field_current_a must be positive, got {}",
                params.field_current_a
            ));
        }
        if !(params.field_step_a > 0.0) {
            return Err(anyhow!(
                "field_step_a must be positive, got {}",
                params.field_step_a
            ));
        }
        if !(params.compliance_voltage_v > 0.0) {
            return Err(anyhow!("compliance_voltage_v must be positive"));
        }
        // The loop covers the amplitude five times.
        check_point_count("field loop", 5.0 * params.field_current_a, params.field_step_a)?;
        params.waiting_time()?;
        Ok(params)
    }

    pub(crate) fn parameter_defs() -> Vec<ParameterDef> {
        vec![
            ParameterDef::float("field_current_a", 4.0, "A", "Maximum current sent to the coil")
                .at_least(0.0),
            ParameterDef::float("field_step_a", 0.1, "A", "Coil current step").at_least(0.0),
            ParameterDef::float("waiting_time_s", 0.2, "s", "Pause after each field point")
                .at_least(0.0),
            ParameterDef::float("bias_current_a", 400e-6, "A", "Bias current through the sample"),
            ParameterDef::float("compliance_voltage_v", 5.0, "V", "Bias voltage compliance")
                .at_least(0.0),
            ParameterDef::flag("four_wire", true, "Measure the Hall voltage with remote sense"),
        ]
    }

    /// Coil currents of the loop.
    pub fn field_loop(&self) -> Vec<f64> {
        hysteresis_loop(self.field_current_a, self.field_step_a)
    }

    /// `|B| / S * waiting * 5`, in seconds.
    pub fn estimated_secs(&self) -> f64 {
        self.field_current_a.abs() / self.field_step_a * self.waiting_time_s * 5.0
    }

    fn waiting_time(&self) -> Result<Duration> {
        Ok(wait_duration("waiting_time_s", self.waiting_time_s)?)
    }
}

// =============================================================================
// Devices and Field Loop
// =============================================================================

/// Instruments a Hall loop talks to.
pub(crate) struct HallDevices {
    coil: Arc<dyn CurrentSource>,
    coil_meter: Arc<dyn CurrentMeter>,
    coil_output: Arc<dyn OutputControl>,
    bias: Arc<dyn CurrentSource>,
    hall_meter: Arc<dyn VoltageMeter>,
    bias_output: Arc<dyn OutputControl>,
}

impl HallDevices {
    pub(crate) async fn resolve(ctx: &ProcedureContext, safe: &mut SafeShutdown) -> Result<Self> {
        let coil = ctx.get_current_source("field_supply").await?;
        let coil_meter = ctx.get_current_meter("field_supply").await?;
        let coil_output = ctx.get_output("field_supply").await?;
        let bias = ctx.get_current_source("hall_meter").await?;
        let hall_meter = ctx.get_voltage_meter("hall_meter").await?;
        let bias_output = ctx.get_output("hall_meter").await?;

        safe.register("field_supply", coil_output.clone());
        safe.register("hall_meter", bias_output.clone());

        Ok(Self {
            coil,
            coil_meter,
            coil_output,
            bias,
            hall_meter,
            bias_output,
        })
    }

    /// Coil at zero and on; bias SMU in current mode with compliance, on; settle.
    pub(crate) async fn configure(
        &self,
        ctx: &ProcedureContext,
        params: &HallSweepParams,
    ) -> Result<()> {
        self.coil.set_current(0.0).await?;
        self.coil_output.enable_output().await?;

        self.hall_meter.set_remote_sense(params.four_wire).await?;
        self.bias.set_voltage_limit(params.compliance_voltage_v).await?;
        self.bias.set_current(0.0).await?;
        self.bias_output.enable_output().await?;
        ctx.sleep(SETTLE_TIME).await;
        Ok(())
    }

    async fn sample(&self, coil_current: f64) -> Result<ResultRow> {
        self.coil.set_current(coil_current).await?;
        let real_current = self.coil_meter.measure_current().await?;
        let hall_voltage = self.hall_meter.measure_voltage().await?;
        Ok(ResultRow::new()
            .with(FIELD_CURRENT_COLUMN, real_current)
            .with(HALL_VOLTAGE_COLUMN, hall_voltage))
    }

    /// Zero bias and coil, then beep both instruments.
    async fn finish(&self) -> Result<()> {
        self.bias.set_current(0.0).await?;
        self.coil.set_current(0.0).await?;
        for output in [&self.bias_output, &self.coil_output] {
            if let Err(e) = output.beep().await {
                tracing::debug!("Beep failed: {}", e);
            }
        }
        Ok(())
    }

    /// Zero and disable both sources.
    pub(crate) async fn stop(&self) {
        for (name, output) in [("hall_meter", &self.bias_output), ("field_supply", &self.coil_output)] {
            if let Err(e) = output.shutdown().await {
                tracing::error!(output = name, "Failed to shut down: {}", e);
            }
        }
    }
}

/// Run the field loop. Returns false when cancelled; both sources are
/// already zeroed and disabled in that case.
pub(crate) async fn run_hall_sweep(
    devices: &HallDevices,
    params: &HallSweepParams,
    ctx: &ProcedureContext,
    progress: &mut RunProgress,
) -> Result<bool> {
    let waiting = params.waiting_time()?;
    let steps = params.field_loop();
    tracing::info!(
        "Field loop: {} points up to ±{} A, bias {} A",
        steps.len(),
        params.field_current_a,
        params.bias_current_a
    );
    devices.bias.set_current(params.bias_current_a).await?;

    for (i, coil_current) in steps.iter().copied().enumerate() {
        let row = match devices.sample(coil_current).await {
            Ok(row) => row,
            Err(e) => {
                devices.stop().await;
                return Err(e);
            }
        };
        progress.record(ctx, row, "field loop").await?;
        let interrupted = ctx.sleep(waiting).await;

        if i + 1 == steps.len() {
            tracing::info!("AHE Measurement finished");
            devices.finish().await?;
        }
        if interrupted || ctx.is_cancelled() {
            tracing::warn!("Catch stop command in field loop at step {}", i);
            devices.stop().await;
            return Ok(false);
        }
    }
    Ok(true)
}

// =============================================================================
// Procedure Implementation
// =============================================================================

/// Anomalous Hall loop procedure
pub struct HallSweepProcedure {
    config: ProcedureConfig,
    params: HallSweepParams,
    state: ProcedureState,
    progress: ProcedureProgress,
    devices: Option<HallDevices>,
    safe: SafeShutdown,
}

impl Default for HallSweepProcedure {
    fn default() -> Self {
        Self::new()
    }
}

impl HallSweepProcedure {
    pub fn new() -> Self {
        Self {
            config: ProcedureConfig::new("hall_sweep"),
            params: HallSweepParams::default(),
            state: ProcedureState::Idle,
            progress: ProcedureProgress::default(),
            devices: None,
            safe: SafeShutdown::new(),
        }
    }

    pub fn params(&self) -> &HallSweepParams {
        &self.params
    }
}

#[async_trait]
impl Procedure for HallSweepProcedure {
    fn type_info() -> ProcedureTypeInfo {
        ProcedureTypeInfo {
            type_id: "hall_sweep".to_string(),
            name: "Anomalous Hall Loop".to_string(),
            description: "Hall voltage over a full coil-current hysteresis loop".to_string(),
            category: "transport".to_string(),
            roles: vec![
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
            parameters: HallSweepParams::parameter_defs(),
            version: "1.0.0".to_string(),
        }
    }

    fn type_id(&self) -> &str {
        "hall_sweep"
    }

    fn state(&self) -> ProcedureState {
        self.state
    }

    fn progress(&self) -> ProcedureProgress {
        self.progress.clone()
    }

    fn configure(&mut self, config: &ProcedureConfig) -> Result<Vec<String>> {
        let warnings = config.validate(&Self::type_info())?;
        self.params = HallSweepParams::from_procedure_config(config)?;
        self.config = config.clone();
        Ok(warnings)
    }

    fn get_config(&self) -> &ProcedureConfig {
        &self.config
    }

    fn estimate(&self) -> Result<Estimate> {
        Ok(Estimate::from_secs_f64(self.params.estimated_secs())?)
    }

    fn preview(&self) -> Vec<PreviewLeg> {
        vec![PreviewLeg {
            label: "field loop".into(),
            unit: "A",
            values: self.params.field_loop(),
        }]
    }

    fn header(&self) -> RunHeader {
        RunHeader {
            procedure: "hall_sweep".to_string(),
            parameters: self.config.effective_parameters(&Self::type_info()),
            columns: HALL_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }

    async fn validate(&mut self, ctx: &ProcedureContext) -> Result<Vec<String>> {
        self.state = ProcedureState::Validating;
        self.devices = Some(HallDevices::resolve(ctx, &mut self.safe).await?);

        let mut warnings = Vec::new();
        if ctx.get_device_id("field_supply") == ctx.get_device_id("hall_meter") {
            warnings.push("field_supply and hall_meter are the same device".to_string());
        }
        Ok(warnings)
    }

    async fn prepare(&mut self, ctx: &ProcedureContext) -> Result<()> {
        self.state = ProcedureState::Preparing;
        let devices = self
            .devices
            .as_ref()
            .ok_or_else(|| anyhow!("hall_sweep prepared before validation"))?;
        devices.configure(ctx, &self.params).await
    }

    async fn execute(&mut self, ctx: ProcedureContext) -> Result<ProcedureResult> {
        let devices = self
            .devices
            .as_ref()
            .ok_or_else(|| anyhow!("hall_sweep executed before validation"))?;
        let total = self.params.field_loop().len();
        let mut timing = ExecutionTiming::start();
        let mut progress = RunProgress::new(total);
        self.state = ProcedureState::Running;

        let completed = match run_hall_sweep(devices, &self.params, &ctx, &mut progress).await {
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
            step_name: "field loop".to_string(),
            overall_progress: progress.percent(),
            message: None,
        };

        let result = if completed {
            ProcedureResult::success("hall_sweep", &ctx.procedure_id)
        } else {
            ProcedureResult::cancelled("hall_sweep", &ctx.procedure_id)
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

// =============================================================================
// Tests
// =============================================================================
