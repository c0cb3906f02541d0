//! Gate Sweep Procedure
//!
//! IV sweep of a gate electrode with a dwell at the extremum:
//! 1. Ramp from one bound to the extremum (`delay_ms` between points)
//! 2. Hold the extremum for `dwell_time_s`, one sample per second
//! 3. Ramp back past the start to the opposite bound
//!
//! The extremum is `max_voltage_mv` when it is positive, `min_voltage_mv`
//! otherwise.
//!
//! # Configuration
//!
//! ```toml
//! [procedure]
//! type = "gate_sweep"
//! name = "Gate sweep ±2 V"
//!
//! [params]
//! max_voltage_mv = 2000
//! min_voltage_mv = -2000
//! voltage_step_mv = 20
//! delay_ms = 100
//! compliance_ua = 1.05
//! dwell_time_s = 30
//!
//! [roles.source]
//! device_id = "gate_smu"
//! ```

use super::panic_safety::SafeShutdown;
use super::{
    ParameterDef, PreviewLeg, Procedure, ProcedureConfig, ProcedureContext, ProcedureProgress,
    ProcedureResult, ProcedureState, ProcedureTypeInfo, RoleRequirement, RunProgress,
};
use crate::data::{ResultRow, RunHeader};
use crate::hardware::capabilities::{CurrentMeter, VoltageMeter, VoltageSource};
use crate::procedures::result::ExecutionTiming;
use crate::sweep::{resistance, wait_duration, Estimate, GateSweep, Leg};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const VOLTAGE_COLUMN: &str = "Voltage (V)";
pub const CURRENT_COLUMN: &str = "Current (A)";
pub const RESISTANCE_COLUMN: &str = "Resistance (ohm)";

/// Columns of a gate-sweep row, in output order.
pub const GATE_COLUMNS: [&str; 3] = [VOLTAGE_COLUMN, CURRENT_COLUMN, RESISTANCE_COLUMN];

/// Wait after switching the source on before the first point.
pub(crate) const SETTLE_TIME: Duration = Duration::from_secs(2);

/// Spacing of dwell samples.
const DWELL_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Configuration
// =============================================================================

/// Typed gate-sweep parameters, in the units the operator enters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSweepParams {
    pub max_voltage_mv: f64,
    pub min_voltage_mv: f64,
    pub voltage_step_mv: f64,
    /// Pause after each ramp point
    pub delay_ms: f64,
    /// Current compliance
    pub compliance_ua: f64,
    pub dwell_time_s: f64,
}

impl Default for GateSweepParams {
    fn default() -> Self {
        Self {
            max_voltage_mv: 2000.0,
            min_voltage_mv: -2000.0,
            voltage_step_mv: 20.0,
            delay_ms: 100.0,
            compliance_ua: 1.05,
            dwell_time_s: 30.0,
        }
    }
}

impl GateSweepParams {
    /// Read from a procedure config, falling back to defaults.
    pub fn from_procedure_config(config: &ProcedureConfig) -> Result<Self> {
        let d = Self::default();
        let params = Self {
            max_voltage_mv: config.f64_or("max_voltage_mv", d.max_voltage_mv)?,
            min_voltage_mv: config.f64_or("min_voltage_mv", d.min_voltage_mv)?,
            voltage_step_mv: config.f64_or("voltage_step_mv", d.voltage_step_mv)?,
            delay_ms: config.f64_or("delay_ms", d.delay_ms)?,
            compliance_ua: config.f64_or("compliance_ua", d.compliance_ua)?,
            dwell_time_s: config.f64_or("dwell_time_s", d.dwell_time_s)?,
        };
        if !(params.compliance_ua > 0.0 && params.compliance_ua.is_finite()) {
            return Err(anyhow!(
                "compliance_ua must be positive, got {}",
                params.compliance_ua
            ));
        }
        // Builds the arrays once to reject bad bounds at configure time.
        params.sweep()?;
        params.delay()?;
        Ok(params)
    }

    pub(crate) fn parameter_defs() -> Vec<ParameterDef> {
        vec![
            ParameterDef::float("max_voltage_mv", 2000.0, "mV", "Upper gate voltage"),
            ParameterDef::float("min_voltage_mv", -2000.0, "mV", "Lower gate voltage"),
            ParameterDef::float("voltage_step_mv", 20.0, "mV", "Gate voltage step")
                .at_least(0.0),
            ParameterDef::float("delay_ms", 100.0, "ms", "Pause after each ramp point")
                .at_least(0.0),
            ParameterDef::float("compliance_ua", 1.05, "uA", "Gate current compliance")
                .at_least(0.0)
                .at_most(1.0e6),
            ParameterDef::float("dwell_time_s", 30.0, "s", "Hold time at the extremum")
                .at_least(0.0),
        ]
    }

    pub fn sweep(&self) -> Result<GateSweep> {
        Ok(GateSweep::new(
            self.min_voltage_mv,
            self.max_voltage_mv,
            self.voltage_step_mv,
            self.dwell_time_s,
        )?)
    }

    /// `|max - min| / step * delay * 2 + dwell`, in seconds.
    pub fn estimated_secs(&self) -> f64 {
        (self.max_voltage_mv - self.min_voltage_mv).abs() / self.voltage_step_mv
            * self.delay_ms
            * 1e-3
            * 2.0
            + self.dwell_time_s
    }

    fn delay(&self) -> Result<Duration> {
        Ok(wait_duration("delay_ms", self.delay_ms * 1e-3)?)
    }

    pub fn compliance_a(&self) -> f64 {
        self.compliance_ua * 1e-6
    }

    /// Approach, dwell and return setpoints in volts.
    pub(crate) fn preview_legs(&self) -> Vec<PreviewLeg> {
        let Ok(sweep) = self.sweep() else {
            return Vec::new();
        };
        vec![
            PreviewLeg {
                label: "approach".into(),
                unit: "V",
                values: sweep.leg(Leg::Approach).to_vec(),
            },
            PreviewLeg {
                label: "dwell".into(),
                unit: "V",
                values: vec![sweep.extremum(); sweep.dwell_samples()],
            },
            PreviewLeg {
                label: "return".into(),
                unit: "V",
                values: sweep.leg(Leg::Return).to_vec(),
            },
        ]
    }
}

// =============================================================================
// Devices and Sweep Loop
// =============================================================================

/// Instruments a gate sweep talks to.
pub(crate) struct GateDevices {
    source: Arc<dyn VoltageSource>,
    meter: Arc<dyn CurrentMeter>,
    /// Measured gate voltage; the setpoint is recorded when absent
    readback: Option<Arc<dyn VoltageMeter>>,
}

impl GateDevices {
    /// `source` must be a voltage source; `meter` defaults to the same device.
    pub(crate) async fn resolve(ctx: &ProcedureContext, safe: &mut SafeShutdown) -> Result<Self> {
        let source = ctx.get_voltage_source("source").await?;
        safe.register("source", ctx.get_output("source").await?);

        let meter_role = if ctx.get_device_id("meter").is_some() {
            "meter"
        } else {
            "source"
        };
        let meter = ctx.get_current_meter(meter_role).await?;
        let readback = match ctx.get_voltage_meter(meter_role).await {
            Ok(m) => Some(m),
            Err(_) => ctx.get_voltage_meter("source").await.ok(),
        };
        if readback.is_none() {
            tracing::warn!("No voltage readback on the gate; recording setpoints");
        }

        Ok(Self {
            source,
            meter,
            readback,
        })
    }

    /// Compliance, output on, settle.
    pub(crate) async fn configure(
        &self,
        ctx: &ProcedureContext,
        params: &GateSweepParams,
    ) -> Result<()> {
        self.source.set_current_limit(params.compliance_a()).await?;
        self.source.enable_output().await?;
        ctx.sleep(SETTLE_TIME).await;
        Ok(())
    }

    async fn sample(&self, setpoint: f64) -> Result<ResultRow> {
        self.source.set_voltage(setpoint).await?;
        let current = self.meter.measure_current().await?;
        let voltage = match &self.readback {
            Some(meter) => meter.measure_voltage().await?,
            None => setpoint,
        };
        Ok(ResultRow::new()
            .with(VOLTAGE_COLUMN, voltage)
            .with(CURRENT_COLUMN, current)
            .with(RESISTANCE_COLUMN, resistance(voltage, current)))
    }

    /// Zero and disable the gate.
    pub(crate) async fn stop(&self) {
        if let Err(e) = self.source.shutdown().await {
            tracing::error!("Failed to shut down gate source: {}", e);
        }
    }
}

/// Walk every step of `sweep`. Returns false when cancelled; the gate is
/// already zeroed and disabled in that case.
pub(crate) async fn run_gate_sweep(
    devices: &GateDevices,
    params: &GateSweepParams,
    sweep: &GateSweep,
    ctx: &ProcedureContext,
    progress: &mut RunProgress,
) -> Result<bool> {
    tracing::info!(
        "Sweeping gate: {} points, dwell {} s at {} V",
        sweep.len(),
        sweep.dwell_samples(),
        sweep.extremum()
    );
    let delay = params.delay()?;

    for step in sweep.steps() {
        let row = devices.sample(step.setpoint).await?;
        let pause = match step.leg {
            Leg::Dwell => DWELL_INTERVAL,
            Leg::Approach | Leg::Return => delay,
        };
        let interrupted = ctx.sleep(pause).await;
        tracing::debug!(leg = step.leg.label(), setpoint = step.setpoint, "Gate point");
        progress.record(ctx, row, step.leg.label()).await?;

        if interrupted || ctx.is_cancelled() {
            tracing::warn!("Catch stop command in gate sweep at step {}", step.index);
            devices.stop().await;
            return Ok(false);
        }
    }
    Ok(true)
}

// =============================================================================
// Procedure Implementation
// =============================================================================

/// Gate sweep procedure
pub struct GateSweepProcedure {
    config: ProcedureConfig,
    params: GateSweepParams,
    state: ProcedureState,
    progress: ProcedureProgress,
    devices: Option<GateDevices>,
    safe: SafeShutdown,
}

impl Default for GateSweepProcedure {
    fn default() -> Self {
        Self::new()
    }
}

impl GateSweepProcedure {
    pub fn new() -> Self {
        Self {
            config: ProcedureConfig::new("gate_sweep"),
            params: GateSweepParams::default(),
            state: ProcedureState::Idle,
            progress: ProcedureProgress::default(),
            devices: None,
            safe: SafeShutdown::new(),
        }
    }

    pub fn params(&self) -> &GateSweepParams {
        &self.params
    }
}

#[async_trait]
impl Procedure for GateSweepProcedure {
    fn type_info() -> ProcedureTypeInfo {
        ProcedureTypeInfo {
            type_id: "gate_sweep".to_string(),
            name: "Gate Sweep".to_string(),
            description: "IV sweep of the gate with a dwell at the extremum".to_string(),
            category: "transport".to_string(),
            roles: vec![
                RoleRequirement::required("source", "VoltageSource", "Gate voltage source"),
                RoleRequirement::optional(
                    "meter",
                    "CurrentMeter",
                    "Gate leakage meter (defaults to the source)",
                ),
            ],
            parameters: GateSweepParams::parameter_defs(),
            version: "1.0.0".to_string(),
        }
    }

    fn type_id(&self) -> &str {
        "gate_sweep"
    }

    fn state(&self) -> ProcedureState {
        self.state
    }

    fn progress(&self) -> ProcedureProgress {
        self.progress.clone()
    }

    fn configure(&mut self, config: &ProcedureConfig) -> Result<Vec<String>> {
        let warnings = config.validate(&Self::type_info())?;
        self.params = GateSweepParams::from_procedure_config(config)?;
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
        self.params.preview_legs()
    }

    fn header(&self) -> RunHeader {
        RunHeader {
            procedure: "gate_sweep".to_string(),
            parameters: self.config.effective_parameters(&Self::type_info()),
            columns: GATE_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }

    async fn validate(&mut self, ctx: &ProcedureContext) -> Result<Vec<String>> {
        self.state = ProcedureState::Validating;
        let mut warnings = Vec::new();

        self.devices = Some(GateDevices::resolve(ctx, &mut self.safe).await?);

        if self.params.dwell_time_s > 3600.0 {
            warnings.push(format!(
                "Dwell of {} s holds the gate for over an hour",
                self.params.dwell_time_s
            ));
        }
        Ok(warnings)
    }

    async fn prepare(&mut self, ctx: &ProcedureContext) -> Result<()> {
        self.state = ProcedureState::Preparing;
        let devices = self
            .devices
            .as_ref()
            .ok_or_else(|| anyhow!("gate_sweep prepared before validation"))?;
        devices.configure(ctx, &self.params).await
    }

    async fn execute(&mut self, ctx: ProcedureContext) -> Result<ProcedureResult> {
        let devices = self
            .devices
            .as_ref()
            .ok_or_else(|| anyhow!("gate_sweep executed before validation"))?;
        let sweep = self.params.sweep()?;
        let mut timing = ExecutionTiming::start();
        let mut progress = RunProgress::new(sweep.len());
        self.state = ProcedureState::Running;

        let completed = match run_gate_sweep(devices, &self.params, &sweep, &ctx, &mut progress)
            .await
        {
            Ok(completed) => completed,
            Err(e) => {
                self.state = ProcedureState::Failed;
                return Err(e);
            }
        };
        timing.stop();

        self.progress = ProcedureProgress {
            state: self.state,
            current_step: progress.rows(),
            total_steps: sweep.len(),
            step_name: "done".to_string(),
            overall_progress: progress.percent(),
            message: None,
        };

        let result = if completed {
            self.state = ProcedureState::Completed;
            ProcedureResult::success("gate_sweep", &ctx.procedure_id)
        } else {
            self.state = ProcedureState::Cancelled;
            ProcedureResult::cancelled("gate_sweep", &ctx.procedure_id)
        };
        self.progress.state = self.state;
        Ok(result.with_rows(progress.rows()).with_timing(timing))
    }

    async fn finalize(&mut self, _ctx: &ProcedureContext) -> Result<()> {
        let previous = self.state;
        self.state = ProcedureState::Finalizing;
        let failed = self.safe.run_all().await;
        self.safe.beep_all().await;
        tracing::info!("Finished");
        self.state = previous;
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
