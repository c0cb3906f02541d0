//! Simulated Hardware
//!
//! Devices that behave like a gated Hall bar on a bench, for dry runs
//! (`--simulate`) and tests. All simulated devices act on one shared
//! [`SimulatedSample`]:
//!
//! - `SimulatedSourceMeter` - SMU sourcing gate voltage (ohmic channel) or a
//!   bias current (reads back the Hall voltage)
//! - `SimulatedFieldSupply` - coil supply; its current sets the magnetization
//!
//! The Hall response is `R_xy = R0 * I_coil + R_AHE * m`, with `m` flipping
//! sign only once the coil current passes the coercive current, so a full
//! field loop traces a square hysteresis.
//!
//! No device sleeps; procedures own all timing.

use crate::error::DaqError;
use crate::hardware::capabilities::{
    CurrentMeter, CurrentSource, OutputControl, VoltageMeter, VoltageSource,
};
use crate::hardware::keithley24xx::SourceFunction;
use crate::hardware::kepco_bop::DEFAULT_MAX_CURRENT_A;
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Physical parameters of the simulated sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleParameters {
    /// Gate channel resistance
    pub channel_resistance_ohm: f64,
    /// Ordinary Hall slope per ampere of coil current
    pub ordinary_hall_ohm_per_a: f64,
    /// Anomalous Hall resistance at saturation
    pub anomalous_hall_ohm: f64,
    /// Coil current that flips the magnetization
    pub coercive_current_a: f64,
    /// Relative Gaussian-ish noise on every reading (0 = exact)
    pub noise_fraction: f64,
}

impl Default for SampleParameters {
    fn default() -> Self {
        Self {
            channel_resistance_ohm: 1.0e6,
            ordinary_hall_ohm_per_a: 0.05,
            anomalous_hall_ohm: 2.0,
            coercive_current_a: 1.0,
            noise_fraction: 0.0,
        }
    }
}

#[derive(Debug)]
struct SampleState {
    coil_current: f64,
    magnetization: f64,
}

/// Shared state of the simulated device under test.
#[derive(Debug)]
pub struct SimulatedSample {
    params: SampleParameters,
    state: Mutex<SampleState>,
}

impl SimulatedSample {
    /// Sample starting at zero field, magnetized down.
    pub fn new(params: SampleParameters) -> Self {
        Self {
            params,
            state: Mutex::new(SampleState {
                coil_current: 0.0,
                magnetization: -1.0,
            }),
        }
    }

    /// Sample parameters.
    pub fn parameters(&self) -> &SampleParameters {
        &self.params
    }

    /// Apply a coil current, switching the magnetization past the coercive current.
    pub fn apply_coil_current(&self, amps: f64) {
        let mut state = lock(&self.state);
        state.coil_current = amps;
        if amps >= self.params.coercive_current_a {
            state.magnetization = 1.0;
        } else if amps <= -self.params.coercive_current_a {
            state.magnetization = -1.0;
        }
    }

    /// Coil current last applied.
    pub fn coil_current(&self) -> f64 {
        lock(&self.state).coil_current
    }

    /// Normalized magnetization (`+1` or `-1`).
    pub fn magnetization(&self) -> f64 {
        lock(&self.state).magnetization
    }

    /// Channel current for a gate voltage, limited by compliance.
    pub fn channel_current(&self, volts: f64, compliance_a: f64) -> f64 {
        let ideal = volts / self.params.channel_resistance_ohm;
        let limit = compliance_a.abs();
        self.noisy(ideal.clamp(-limit, limit))
    }

    /// Transverse voltage for a bias current.
    pub fn hall_voltage(&self, bias_a: f64) -> f64 {
        let state = lock(&self.state);
        let r_xy = self.params.ordinary_hall_ohm_per_a * state.coil_current
            + self.params.anomalous_hall_ohm * state.magnetization;
        drop(state);
        self.noisy(bias_a * r_xy)
    }

    fn noisy(&self, value: f64) -> f64 {
        if self.params.noise_fraction <= 0.0 {
            return value;
        }
        let jitter: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        value * (1.0 + self.params.noise_fraction * jitter)
    }
}

impl Default for SimulatedSample {
    fn default() -> Self {
        Self::new(SampleParameters::default())
    }
}

#[derive(Debug)]
struct SmuState {
    function: SourceFunction,
    voltage: f64,
    current: f64,
    current_limit: f64,
    voltage_limit: f64,
}

/// Simulated SMU wired to the sample.
///
/// Sourcing voltage it measures the channel current; sourcing current it
/// measures the Hall voltage.
pub struct SimulatedSourceMeter {
    sample: Arc<SimulatedSample>,
    state: Mutex<SmuState>,
    output_enabled: AtomicBool,
    four_wire: AtomicBool,
    history: Mutex<Vec<f64>>,
    beeps: Mutex<usize>,
}

impl SimulatedSourceMeter {
    /// New SMU at 0 V with output off.
    pub fn new(sample: Arc<SimulatedSample>) -> Self {
        Self {
            sample,
            state: Mutex::new(SmuState {
                function: SourceFunction::Voltage,
                voltage: 0.0,
                current: 0.0,
                current_limit: 0.1,
                voltage_limit: 20.0,
            }),
            output_enabled: AtomicBool::new(false),
            four_wire: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
            beeps: Mutex::new(0),
        }
    }

    /// Whether remote sense (4-wire) is selected.
    pub fn is_four_wire(&self) -> bool {
        self.four_wire.load(Ordering::SeqCst)
    }

    /// Every setpoint written, in order.
    pub fn setpoints(&self) -> Vec<f64> {
        lock(&self.history).clone()
    }

    /// Present source level (volts or amperes, per function).
    pub fn level(&self) -> f64 {
        let state = lock(&self.state);
        match state.function {
            SourceFunction::Voltage => state.voltage,
            SourceFunction::Current => state.current,
        }
    }

    /// Whether the output is connected.
    pub fn is_output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::SeqCst)
    }

    /// Number of beeps requested.
    pub fn beep_count(&self) -> usize {
        *lock(&self.beeps)
    }

    /// Configured current compliance.
    pub fn current_limit(&self) -> f64 {
        lock(&self.state).current_limit
    }
}

#[async_trait]
impl OutputControl for SimulatedSourceMeter {
    async fn enable_output(&self) -> Result<()> {
        self.output_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable_output(&self) -> Result<()> {
        self.output_enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.voltage = 0.0;
            state.current = 0.0;
        }
        lock(&self.history).push(0.0);
        self.disable_output().await
    }

    async fn beep(&self) -> Result<()> {
        *lock(&self.beeps) += 1;
        Ok(())
    }
}

#[async_trait]
impl VoltageSource for SimulatedSourceMeter {
    async fn set_voltage(&self, volts: f64) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.function = SourceFunction::Voltage;
            state.voltage = volts;
        }
        lock(&self.history).push(volts);
        Ok(())
    }

    async fn set_current_limit(&self, amps: f64) -> Result<()> {
        lock(&self.state).current_limit = amps;
        Ok(())
    }
}

#[async_trait]
impl CurrentSource for SimulatedSourceMeter {
    async fn set_current(&self, amps: f64) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.function = SourceFunction::Current;
            state.current = amps;
        }
        lock(&self.history).push(amps);
        Ok(())
    }

    async fn set_voltage_limit(&self, volts: f64) -> Result<()> {
        lock(&self.state).voltage_limit = volts;
        Ok(())
    }
}

#[async_trait]
impl VoltageMeter for SimulatedSourceMeter {
    async fn measure_voltage(&self) -> Result<f64> {
        if !self.is_output_enabled() {
            return Ok(0.0);
        }
        let (function, voltage, current, limit) = {
            let s = lock(&self.state);
            (s.function, s.voltage, s.current, s.voltage_limit)
        };
        Ok(match function {
            SourceFunction::Voltage => voltage,
            SourceFunction::Current => self.sample.hall_voltage(current).clamp(-limit, limit),
        })
    }

    async fn set_remote_sense(&self, four_wire: bool) -> Result<()> {
        self.four_wire.store(four_wire, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl CurrentMeter for SimulatedSourceMeter {
    async fn measure_current(&self) -> Result<f64> {
        if !self.is_output_enabled() {
            return Ok(0.0);
        }
        let (function, voltage, current, limit) = {
            let s = lock(&self.state);
            (s.function, s.voltage, s.current, s.current_limit)
        };
        Ok(match function {
            SourceFunction::Voltage => self.sample.channel_current(voltage, limit),
            SourceFunction::Current => current,
        })
    }
}

/// Simulated coil supply wired to the sample.
pub struct SimulatedFieldSupply {
    sample: Arc<SimulatedSample>,
    max_current_a: f64,
    output_enabled: AtomicBool,
    history: Mutex<Vec<f64>>,
    beeps: Mutex<usize>,
}

impl SimulatedFieldSupply {
    /// New supply with the default coil-current limit.
    pub fn new(sample: Arc<SimulatedSample>) -> Self {
        Self {
            sample,
            max_current_a: DEFAULT_MAX_CURRENT_A,
            output_enabled: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
            beeps: Mutex::new(0),
        }
    }

    /// Override the coil-current limit.
    pub fn with_max_current(mut self, amps: f64) -> Self {
        self.max_current_a = amps;
        self
    }

    /// Every coil current written, in order.
    pub fn setpoints(&self) -> Vec<f64> {
        lock(&self.history).clone()
    }

    /// Whether the output is connected.
    pub fn is_output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::SeqCst)
    }

    /// Present coil current.
    pub fn level(&self) -> f64 {
        self.sample.coil_current()
    }

    /// Number of beeps requested.
    pub fn beep_count(&self) -> usize {
        *lock(&self.beeps)
    }

    fn apply(&self, amps: f64) {
        self.sample.apply_coil_current(amps);
        lock(&self.history).push(amps);
    }
}

#[async_trait]
impl OutputControl for SimulatedFieldSupply {
    async fn enable_output(&self) -> Result<()> {
        self.output_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disable_output(&self) -> Result<()> {
        self.output_enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.apply(0.0);
        self.disable_output().await
    }

    async fn beep(&self) -> Result<()> {
        *lock(&self.beeps) += 1;
        Ok(())
    }
}

#[async_trait]
impl CurrentSource for SimulatedFieldSupply {
    async fn set_current(&self, amps: f64) -> Result<()> {
        if !amps.is_finite() || amps.abs() >= self.max_current_a {
            self.apply(0.0);
            return Err(DaqError::SafetyLimit(format!(
                "coil current {} A is at or above the {} A limit",
                amps, self.max_current_a
            ))
            .into());
        }
        self.apply(amps);
        Ok(())
    }

    async fn set_voltage_limit(&self, _volts: f64) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl CurrentMeter for SimulatedFieldSupply {
    async fn measure_current(&self) -> Result<f64> {
        if !self.is_output_enabled() {
            return Ok(0.0);
        }
        Ok(self.sample.coil_current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ohmic_channel_respects_compliance() {
        let sample = Arc::new(SimulatedSample::default());
        let smu = SimulatedSourceMeter::new(sample);
        smu.set_current_limit(1.05e-6).await.unwrap();
        smu.enable_output().await.unwrap();

        smu.set_voltage(0.5).await.unwrap();
        assert!((smu.measure_current().await.unwrap() - 5e-7).abs() < 1e-15);

        smu.set_voltage(2.0).await.unwrap();
        assert!((smu.measure_current().await.unwrap() - 1.05e-6).abs() < 1e-15);
        assert_eq!(smu.measure_voltage().await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn magnetization_has_hysteresis() {
        let sample = Arc::new(SimulatedSample::default());
        let coil = SimulatedFieldSupply::new(sample.clone());
        let smu = SimulatedSourceMeter::new(sample.clone());
        coil.enable_output().await.unwrap();
        smu.enable_output().await.unwrap();
        smu.set_current(400e-6).await.unwrap();

        coil.set_current(0.5).await.unwrap();
        let below = smu.measure_voltage().await.unwrap();
        assert!(below < 0.0);

        coil.set_current(1.5).await.unwrap();
        coil.set_current(0.5).await.unwrap();
        let after_saturation = smu.measure_voltage().await.unwrap();
        assert!(after_saturation > 0.0);
        assert_eq!(sample.magnetization(), 1.0);
    }

    #[tokio::test]
    async fn field_supply_refuses_over_limit() {
        let sample = Arc::new(SimulatedSample::default());
        let coil = SimulatedFieldSupply::new(sample).with_max_current(5.0);
        coil.set_current(2.0).await.unwrap();
        assert!(coil.set_current(5.0).await.is_err());
        assert_eq!(coil.level(), 0.0);
        assert_eq!(coil.setpoints(), vec![2.0, 0.0]);
    }

    #[tokio::test]
    async fn shutdown_zeroes_and_disables() {
        let sample = Arc::new(SimulatedSample::default());
        let smu = SimulatedSourceMeter::new(sample);
        smu.enable_output().await.unwrap();
        smu.set_voltage(1.0).await.unwrap();
        smu.shutdown().await.unwrap();
        assert_eq!(smu.level(), 0.0);
        assert!(!smu.is_output_enabled());
        assert_eq!(smu.measure_current().await.unwrap(), 0.0);
    }

    #[test]
    fn noise_stays_within_fraction() {
        let sample = SimulatedSample::new(SampleParameters {
            noise_fraction: 0.01,
            ..SampleParameters::default()
        });
        for _ in 0..100 {
            let i = sample.channel_current(1.0, 1.0);
            assert!((i - 1e-6).abs() <= 1e-8 + 1e-18);
        }
    }
}
