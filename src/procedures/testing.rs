//! Simulated bench shared by the procedure tests.

use super::{ProcedureConfig, ProcedureContext};
use crate::data::MemorySink;
use crate::hardware::registry::{DeviceHandles, DeviceRegistry};
use crate::hardware::simulated::{SimulatedFieldSupply, SimulatedSample, SimulatedSourceMeter};
use std::sync::Arc;
use tokio::sync::RwLock;

/// `smu` (Hall bias), `gate` (gate source) and `coil` on one sample.
pub(crate) struct Bench {
    pub registry: Arc<RwLock<DeviceRegistry>>,
    pub smu: Arc<SimulatedSourceMeter>,
    pub gate: Arc<SimulatedSourceMeter>,
    pub coil: Arc<SimulatedFieldSupply>,
}

impl Bench {
    pub fn new() -> Self {
        Self::with_coil_limit(29.0)
    }

    pub fn with_coil_limit(max_current_a: f64) -> Self {
        let sample = Arc::new(SimulatedSample::default());
        let smu = Arc::new(SimulatedSourceMeter::new(sample.clone()));
        let gate = Arc::new(SimulatedSourceMeter::new(sample.clone()));
        let coil = Arc::new(SimulatedFieldSupply::new(sample.clone()).with_max_current(max_current_a));

        let mut registry = DeviceRegistry::with_sample(sample);
        registry
            .insert("smu", "Sim SMU", "simulated_source_meter", DeviceHandles::source_meter(smu.clone()))
            .unwrap();
        registry
            .insert("gate", "Sim gate", "simulated_source_meter", DeviceHandles::source_meter(gate.clone()))
            .unwrap();
        registry
            .insert("coil", "Sim coil", "simulated_field_supply", DeviceHandles::current_supply(coil.clone()))
            .unwrap();

        Self {
            registry: Arc::new(RwLock::new(registry)),
            smu,
            gate,
            coil,
        }
    }

    /// Context for `config`'s roles writing into a fresh memory sink.
    pub fn context(&self, config: &ProcedureConfig) -> (ProcedureContext, MemorySink) {
        let sink = MemorySink::new();
        let (ctx, _progress) = ProcedureContext::new(
            "test-run",
            config.get_assignments(),
            self.registry.clone(),
            Box::new(sink.clone()),
        );
        (ctx, sink)
    }
}

/// Percentages never decrease and the last one is 100.
pub(crate) fn assert_progress_complete(progress: &[f64]) {
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
    assert_eq!(*progress.last().unwrap(), 100.0);
}
