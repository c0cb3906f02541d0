//! Procedure Framework for Transport Measurements
//!
//! A procedure is one parameterized measurement run: a gate sweep, an
//! anomalous-Hall field loop, the two back to back, or a constant-field hold.
//!
//! # Key Concepts
//!
//! - **Procedure**: a configured measurement with a fixed lifecycle
//! - **ProcedureConfig**: TOML parameters and device role assignments
//! - **ProcedureContext**: devices, result sink, progress and cancellation
//! - **ProcedureRegistry**: discovery and instantiation of procedure types
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        ProcedureRegistry                                │
//! │   gate_sweep   hall_sweep   gate_then_hall   field_hold                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                        Procedure Trait                                  │
//! │  configure() → validate() → prepare() → execute() → finalize()          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                        ProcedureContext                                 │
//! │  roles → DeviceRegistry │ ResultSink │ progress watch │ cancel watch    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use transport_daq::procedures::{execute_procedure_safely, ProcedureConfig, ProcedureRegistry};
//!
//! let config = ProcedureConfig::from_file(Path::new("config/procedures/gate_sweep.toml"))?;
//! let registry = ProcedureRegistry::new(device_registry.clone());
//! let mut procedure = registry.create_from_config(&config)?;
//!
//! let (ctx, _progress) = ProcedureContext::new("run-1", config.get_assignments(), device_registry, sink);
//! let result = execute_procedure_safely(procedure.as_mut(), ctx, EmergencyStopFlag::new()).await?;
//! println!("{}", result.summary());
//! ```

pub mod config;
pub mod field_hold;
pub mod gate_sweep;
pub mod gate_then_hall;
pub mod hall_sweep;
pub mod panic_safety;
pub mod result;
pub mod sequence;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use config::{ConfigOverride, ConfigValue, ProcedureConfig, RoleAssignment};
pub use field_hold::FieldHoldProcedure;
pub use gate_sweep::GateSweepProcedure;
pub use gate_then_hall::GateThenHallProcedure;
pub use hall_sweep::HallSweepProcedure;
pub use panic_safety::{EmergencyStopFlag, PanicGuard, SafeShutdown};
pub use result::{ExecutionTiming, ProcedureResult, RunOutcome};
pub use sequence::{run_sequence, SequenceConfig, SequenceReport};

use crate::data::{ResultRow, ResultSink, RunHeader};
use crate::hardware::capabilities::{
    CurrentMeter, CurrentSource, OutputControl, VoltageMeter, VoltageSource,
};
use crate::hardware::registry::DeviceRegistry;
use crate::sweep::{Estimate, ProgressTracker};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};

// =============================================================================
// Procedure Type Metadata
// =============================================================================

/// Information about a procedure type (for the registry and `list`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureTypeInfo {
    /// Unique type identifier (e.g., "gate_sweep")
    pub type_id: String,
    /// Human-readable name
    pub name: String,
    /// Description of what this procedure does
    pub description: String,
    /// Category for organization (e.g., "transport", "field")
    pub category: String,
    /// Device roles
    pub roles: Vec<RoleRequirement>,
    /// Available parameters with defaults
    pub parameters: Vec<ParameterDef>,
    /// Version string
    pub version: String,
}

/// Requirement for a device role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRequirement {
    /// Role identifier (e.g., "source", "field_supply")
    pub role_id: String,
    /// Required capability name (e.g., "VoltageSource")
    pub capability: String,
    /// Whether this role can be left unassigned
    pub optional: bool,
    /// Description of the role's purpose
    pub description: String,
}

impl RoleRequirement {
    fn required(role_id: &str, capability: &str, description: &str) -> Self {
        Self {
            role_id: role_id.into(),
            capability: capability.into(),
            optional: false,
            description: description.into(),
        }
    }

    fn optional(role_id: &str, capability: &str, description: &str) -> Self {
        Self {
            optional: true,
            ..Self::required(role_id, capability, description)
        }
    }
}

/// Parameter definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name
    pub name: String,
    /// Type name ("f64", "bool")
    pub param_type: String,
    /// Default value as string; `None` makes the parameter required
    pub default: Option<String>,
    /// Unit of measurement
    pub units: Option<String>,
    /// Description
    pub description: String,
    /// Numeric bounds
    pub constraints: Option<ParameterConstraints>,
}

impl ParameterDef {
    fn float(name: &str, default: f64, units: &str, description: &str) -> Self {
        Self {
            name: name.into(),
            param_type: "f64".into(),
            default: Some(default.to_string()),
            units: Some(units.into()),
            description: description.into(),
            constraints: None,
        }
    }

    fn flag(name: &str, default: bool, description: &str) -> Self {
        Self {
            name: name.into(),
            param_type: "bool".into(),
            default: Some(default.to_string()),
            units: None,
            description: description.into(),
            constraints: None,
        }
    }

    fn at_least(mut self, min: f64) -> Self {
        self.constraints.get_or_insert_with(Default::default).min = Some(min);
        self
    }

    fn at_most(mut self, max: f64) -> Self {
        self.constraints.get_or_insert_with(Default::default).max = Some(max);
        self
    }
}

/// Parameter constraints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterConstraints {
    /// Minimum value (numeric)
    pub min: Option<f64>,
    /// Maximum value (numeric)
    pub max: Option<f64>,
}

// =============================================================================
// Procedure State and Progress
// =============================================================================

/// Current state of a procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureState {
    /// Not yet started
    Idle,
    /// Checking roles and devices
    Validating,
    /// Configuring instruments
    Preparing,
    /// Sweeping
    Running,
    /// Bringing sources to a safe state
    Finalizing,
    /// Finished every setpoint
    Completed,
    /// Stopped by an error
    Failed,
    /// Stopped on request
    Cancelled,
}

/// Progress report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureProgress {
    pub state: ProcedureState,
    /// Samples completed
    pub current_step: usize,
    /// Samples expected
    pub total_steps: usize,
    /// Current phase ("approach", "dwell", "field loop", ...)
    pub step_name: String,
    /// Overall progress in percent (0-100)
    pub overall_progress: f64,
    /// Status message
    pub message: Option<String>,
}

impl Default for ProcedureProgress {
    fn default() -> Self {
        Self {
            state: ProcedureState::Idle,
            current_step: 0,
            total_steps: 0,
            step_name: String::new(),
            overall_progress: 0.0,
            message: None,
        }
    }
}

/// Setpoints of one phase, for `preview`
#[derive(Debug, Clone, PartialEq)]
pub struct PreviewLeg {
    pub label: String,
    pub unit: &'static str,
    pub values: Vec<f64>,
}

// =============================================================================
// Procedure Trait
// =============================================================================

/// Core trait for all measurement procedures
///
/// Lifecycle: `configure()` → `validate()` → `prepare()` → `execute()` →
/// `finalize()`. `finalize()` runs whatever happened before it and must leave
/// every source zeroed and disabled.
#[async_trait]
pub trait Procedure: Send + Sync {
    /// Static information about this procedure type
    fn type_info() -> ProcedureTypeInfo
    where
        Self: Sized;

    /// Type ID of this instance
    fn type_id(&self) -> &str;

    fn state(&self) -> ProcedureState;

    fn progress(&self) -> ProcedureProgress;

    /// Apply configuration. Returns non-fatal warnings.
    fn configure(&mut self, config: &ProcedureConfig) -> Result<Vec<String>>;

    fn get_config(&self) -> &ProcedureConfig;

    /// Expected run time with the current parameters
    fn estimate(&self) -> Result<Estimate>;

    /// Setpoints that would be applied, phase by phase
    fn preview(&self) -> Vec<PreviewLeg>;

    /// Header written to the result sink before the first row
    fn header(&self) -> RunHeader;

    /// Resolve devices for every role. Returns warnings.
    async fn validate(&mut self, ctx: &ProcedureContext) -> Result<Vec<String>>;

    /// Configure instruments and switch outputs on.
    async fn prepare(&mut self, ctx: &ProcedureContext) -> Result<()>;

    /// Run the sweep, polling `ctx.is_cancelled()` once per sample.
    async fn execute(&mut self, ctx: ProcedureContext) -> Result<ProcedureResult>;

    /// Zero and disable every source. Always called after `prepare()`.
    async fn finalize(&mut self, ctx: &ProcedureContext) -> Result<()>;

    /// Request a stop at the next sample.
    async fn cancel(&mut self) -> Result<()>;
}

// =============================================================================
// Cancellation
// =============================================================================

/// Requests cancellation of every context subscribed to it.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask the running procedure to stop.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Procedure Context
// =============================================================================

type SharedSink = Arc<Mutex<Box<dyn ResultSink>>>;

/// Context provided to procedures for device access, output and progress.
pub struct ProcedureContext {
    /// Procedure instance ID
    pub procedure_id: String,

    /// Device assignments: role_id -> device_id
    assignments: HashMap<String, String>,

    /// Device registry for hardware access
    registry: Arc<RwLock<DeviceRegistry>>,

    /// Where result rows go
    sink: SharedSink,

    /// Progress sender (for the CLI progress line)
    progress_tx: watch::Sender<ProcedureProgress>,

    cancel: CancelHandle,
    cancel_rx: watch::Receiver<bool>,
}

impl ProcedureContext {
    /// Create a new procedure context
    pub fn new(
        procedure_id: impl Into<String>,
        assignments: HashMap<String, String>,
        registry: Arc<RwLock<DeviceRegistry>>,
        sink: Box<dyn ResultSink>,
    ) -> (Self, watch::Receiver<ProcedureProgress>) {
        let (progress_tx, progress_rx) = watch::channel(ProcedureProgress::default());
        let cancel = CancelHandle::new();
        let cancel_rx = cancel.subscribe();

        let ctx = Self {
            procedure_id: procedure_id.into(),
            assignments,
            registry,
            sink: Arc::new(Mutex::new(sink)),
            progress_tx,
            cancel,
            cancel_rx,
        };

        (ctx, progress_rx)
    }

    /// Follow an existing cancel handle instead of a private one.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel_rx = cancel.subscribe();
        self.cancel = cancel;
        self
    }

    /// Handle that cancels this context.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Get device ID for a role
    pub fn get_device_id(&self, role_id: &str) -> Option<&String> {
        self.assignments.get(role_id)
    }

    async fn lookup<T>(
        &self,
        role_id: &str,
        capability: &str,
        get: impl FnOnce(&DeviceRegistry, &str) -> Option<T>,
    ) -> Result<T> {
        let device_id = self
            .assignments
            .get(role_id)
            .ok_or_else(|| anyhow!("Role '{}' is not assigned to a device", role_id))?;
        let registry = self.registry.read().await;
        if !registry.contains(device_id) {
            return Err(anyhow!(
                "Device '{}' (role '{}') is not connected",
                device_id,
                role_id
            ));
        }
        get(&registry, device_id).ok_or_else(|| {
            anyhow!(
                "Device '{}' (role '{}') is not a {}",
                device_id,
                role_id,
                capability
            )
        })
    }

    pub async fn get_output(&self, role_id: &str) -> Result<Arc<dyn OutputControl>> {
        self.lookup(role_id, "OutputControl", |r, id| r.get_output(id))
            .await
    }

    pub async fn get_voltage_source(&self, role_id: &str) -> Result<Arc<dyn VoltageSource>> {
        self.lookup(role_id, "VoltageSource", |r, id| r.get_voltage_source(id))
            .await
    }

    pub async fn get_current_source(&self, role_id: &str) -> Result<Arc<dyn CurrentSource>> {
        self.lookup(role_id, "CurrentSource", |r, id| r.get_current_source(id))
            .await
    }

    pub async fn get_voltage_meter(&self, role_id: &str) -> Result<Arc<dyn VoltageMeter>> {
        self.lookup(role_id, "VoltageMeter", |r, id| r.get_voltage_meter(id))
            .await
    }

    pub async fn get_current_meter(&self, role_id: &str) -> Result<Arc<dyn CurrentMeter>> {
        self.lookup(role_id, "CurrentMeter", |r, id| r.get_current_meter(id))
            .await
    }

    /// Start the result file.
    pub async fn begin_run(&self, header: &RunHeader) -> Result<()> {
        self.sink.lock().await.begin(header).await?;
        Ok(())
    }

    /// Hand one row to the sink.
    pub async fn emit(&self, row: &ResultRow) -> Result<()> {
        self.sink.lock().await.emit(row).await?;
        Ok(())
    }

    /// Close the result file.
    pub async fn finish_run(&self) -> Result<()> {
        self.sink.lock().await.finish().await?;
        Ok(())
    }

    /// Publish progress to the watch channel and the sink.
    pub async fn update_progress(&self, progress: ProcedureProgress) -> Result<()> {
        let percent = progress.overall_progress;
        self.progress_tx.send_replace(progress);
        self.sink.lock().await.progress(percent).await?;
        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Sleep, waking early on cancellation. Returns true when cancelled.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let mut rx = self.cancel_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_cancelled(),
            changed = rx.wait_for(|cancelled| *cancelled) => changed.is_ok(),
        }
    }
}

impl Clone for ProcedureContext {
    fn clone(&self) -> Self {
        Self {
            procedure_id: self.procedure_id.clone(),
            assignments: self.assignments.clone(),
            registry: Arc::clone(&self.registry),
            sink: Arc::clone(&self.sink),
            progress_tx: self.progress_tx.clone(),
            cancel: self.cancel.clone(),
            cancel_rx: self.cancel_rx.clone(),
        }
    }
}

// =============================================================================
// Row Recording
// =============================================================================

/// Counts rows of one run and turns them into progress reports.
pub struct RunProgress {
    tracker: ProgressTracker,
    rows: usize,
}

impl RunProgress {
    /// Progress over `total_samples` rows.
    pub fn new(total_samples: usize) -> Self {
        Self {
            tracker: ProgressTracker::new(total_samples),
            rows: 0,
        }
    }

    /// Emit `row`, then report progress under `phase`.
    pub async fn record(
        &mut self,
        ctx: &ProcedureContext,
        row: ResultRow,
        phase: &str,
    ) -> Result<f64> {
        ctx.emit(&row).await?;
        self.rows += 1;
        let percent = self.tracker.advance();
        ctx.update_progress(ProcedureProgress {
            state: ProcedureState::Running,
            current_step: self.tracker.completed(),
            total_steps: self.tracker.total(),
            step_name: phase.to_string(),
            overall_progress: percent,
            message: None,
        })
        .await?;
        Ok(percent)
    }

    /// Rows emitted so far
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn percent(&self) -> f64 {
        self.tracker.percent()
    }
}

// =============================================================================
// Procedure Registry
// =============================================================================

/// Factory function for creating procedures
pub type ProcedureFactory = fn() -> Box<dyn Procedure>;

/// Registry for procedure types
pub struct ProcedureRegistry {
    /// Device registry for hardware access
    device_registry: Arc<RwLock<DeviceRegistry>>,

    /// Registered procedure types: type_id -> factory
    procedure_types: HashMap<String, ProcedureFactory>,

    /// Procedure type info cache
    type_info_cache: HashMap<String, ProcedureTypeInfo>,
}

impl ProcedureRegistry {
    /// Create a registry with the built-in procedures
    pub fn new(device_registry: Arc<RwLock<DeviceRegistry>>) -> Self {
        let mut registry = Self {
            device_registry,
            procedure_types: HashMap::new(),
            type_info_cache: HashMap::new(),
        };
        registry.register_builtin_procedures();
        registry
    }

    fn register_builtin_procedures(&mut self) {
        self.register_type::<GateSweepProcedure>();
        self.register_type::<HallSweepProcedure>();
        self.register_type::<GateThenHallProcedure>();
        self.register_type::<FieldHoldProcedure>();
    }

    /// Register a procedure type
    pub fn register_type<P: Procedure + Default + 'static>(&mut self) {
        let info = P::type_info();
        let type_id = info.type_id.clone();
        self.type_info_cache.insert(type_id.clone(), info);
        self.procedure_types
            .insert(type_id, || Box::new(P::default()));
    }

    /// All registered procedure types, sorted by ID
    pub fn list_types(&self) -> Vec<&ProcedureTypeInfo> {
        let mut types: Vec<_> = self.type_info_cache.values().collect();
        types.sort_by(|a, b| a.type_id.cmp(&b.type_id));
        types
    }

    /// Get info for a specific procedure type
    pub fn get_type_info(&self, type_id: &str) -> Option<&ProcedureTypeInfo> {
        self.type_info_cache.get(type_id)
    }

    /// Create and configure a procedure
    pub fn create_from_config(&self, config: &ProcedureConfig) -> Result<Box<dyn Procedure>> {
        let type_id = &config.procedure_type;
        let factory = self
            .procedure_types
            .get(type_id)
            .ok_or_else(|| anyhow!("Unknown procedure type: {}", type_id))?;

        let mut procedure = factory();
        for warning in procedure.configure(config)? {
            tracing::warn!(procedure = %type_id, "{}", warning);
        }
        Ok(procedure)
    }

    /// Get the device registry
    pub fn device_registry(&self) -> Arc<RwLock<DeviceRegistry>> {
        Arc::clone(&self.device_registry)
    }
}

// =============================================================================
// Safe Procedure Execution
// =============================================================================

/// Execute a procedure with guaranteed cleanup on panic or error.
///
/// 1. `finalize()` runs whenever `prepare()` was attempted, even if
///    `prepare()` or `execute()` failed
/// 2. the result sink is closed on every path past `begin_run`
/// 3. the emergency stop flag is set if the future is dropped mid-run or panics
pub async fn execute_procedure_safely(
    procedure: &mut dyn Procedure,
    ctx: ProcedureContext,
    emergency_flag: EmergencyStopFlag,
) -> Result<ProcedureResult> {
    let panic_guard = emergency_flag.guard(format!("Procedure: {}", procedure.type_id()));

    let warnings = procedure.validate(&ctx).await?;
    for warning in &warnings {
        tracing::warn!(procedure = %procedure.type_id(), "{}", warning);
    }

    let estimate = procedure.estimate()?;
    tracing::info!(
        procedure = %procedure.type_id(),
        "Estimated duration {:.0} s, finishing around {}",
        estimate.duration.as_secs_f64(),
        estimate.finished_at.format("%H:%M:%S")
    );

    ctx.begin_run(&procedure.header()).await?;

    let result = match procedure.prepare(&ctx).await {
        Ok(()) => procedure.execute(ctx.clone()).await,
        Err(e) => Err(e),
    };

    let finalized = procedure.finalize(&ctx).await;
    if let Err(e) = &finalized {
        tracing::error!("Procedure finalize failed: {}", e);
    }
    let finished = ctx.finish_run().await;
    if let Err(e) = &finished {
        tracing::error!("Closing results failed: {}", e);
    }

    panic_guard.dismiss();

    let mut result = result?;
    finalized?;
    finished?;

    result.timing.estimated = Some(estimate.duration);
    result.warnings.extend(warnings);
    tracing::info!("{}", result.summary());
    Ok(result)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemorySink;
    use crate::hardware::registry::create_simulated_registry;

    async fn context() -> (ProcedureContext, MemorySink) {
        let registry = Arc::new(RwLock::new(create_simulated_registry().await.unwrap()));
        let sink = MemorySink::new();
        let mut roles = HashMap::new();
        roles.insert("source".to_string(), "smu".to_string());
        roles.insert("field_supply".to_string(), "coil".to_string());
        roles.insert("ghost".to_string(), "not_connected".to_string());
        let (ctx, _rx) = ProcedureContext::new("test", roles, registry, Box::new(sink.clone()));
        (ctx, sink)
    }

    #[test]
    fn test_progress_default() {
        let progress = ProcedureProgress::default();
        assert_eq!(progress.state, ProcedureState::Idle);
        assert_eq!(progress.overall_progress, 0.0);
    }

    #[tokio::test]
    async fn test_role_lookup_errors_name_the_problem() {
        let (ctx, _) = context().await;
        assert!(ctx.get_voltage_source("source").await.is_ok());

        let err = ctx.get_voltage_source("meter").await.err().unwrap();
        assert!(err.to_string().contains("not assigned"));

        let err = ctx.get_voltage_source("field_supply").await.err().unwrap();
        assert!(err.to_string().contains("not a VoltageSource"));

        let err = ctx.get_output("ghost").await.err().unwrap();
        assert!(err.to_string().contains("not connected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_wakes_on_cancel() {
        let (ctx, _) = context().await;
        let handle = ctx.cancel_handle();
        let sleeper = ctx.clone();
        let task = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        handle.cancel();
        assert!(task.await.unwrap());
        assert!(ctx.is_cancelled());
        assert!(ctx.sleep(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs_to_completion() {
        let (ctx, _) = context().await;
        assert!(!ctx.sleep(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_shared_cancel_handle() {
        let (ctx, _) = context().await;
        let handle = CancelHandle::new();
        let ctx = ctx.with_cancel_handle(handle.clone());
        assert!(!ctx.is_cancelled());
        handle.cancel();
        assert!(ctx.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_progress_reports_to_sink() {
        let (ctx, sink) = context().await;
        let mut progress = RunProgress::new(2);
        progress
            .record(&ctx, ResultRow::new().with("x", 1.0), "approach")
            .await
            .unwrap();
        let last = progress
            .record(&ctx, ResultRow::new().with("x", 2.0), "approach")
            .await
            .unwrap();
        assert_eq!(last, 100.0);
        assert_eq!(progress.rows(), 2);

        let recorded = sink.snapshot();
        assert_eq!(recorded.rows.len(), 2);
        assert_eq!(recorded.progress, vec![50.0, 100.0]);
    }

    #[tokio::test]
    async fn test_registry_lists_builtins() {
        let devices = Arc::new(RwLock::new(DeviceRegistry::new()));
        let registry = ProcedureRegistry::new(devices);
        let ids: Vec<&str> = registry
            .list_types()
            .iter()
            .map(|t| t.type_id.as_str())
            .collect();
        assert_eq!(
            ids,
            vec!["field_hold", "gate_sweep", "gate_then_hall", "hall_sweep"]
        );

        let unknown = ProcedureConfig::new("rotator_calibration");
        assert!(registry.create_from_config(&unknown).is_err());
    }
}
