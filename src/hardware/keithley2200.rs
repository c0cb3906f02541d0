//! Keithley 2200-series programmable DC supply.
//!
//! A voltage source with a settable current limit and built-in readback.
//! Used as the gate supply when an SMU is not available.

use crate::hardware::capabilities::{CurrentMeter, OutputControl, VoltageMeter, VoltageSource};
use crate::hardware::scpi::{self, parse_f64_response, Identity, ScpiTransport};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Keithley 2200 single-channel supply.
pub struct Keithley2200 {
    transport: Arc<dyn ScpiTransport>,
}

impl Keithley2200 {
    /// Wrap an open transport.
    pub fn new(transport: Arc<dyn ScpiTransport>) -> Self {
        Self { transport }
    }

    /// Query `*IDN?`.
    pub async fn identify(&self) -> Result<Identity> {
        scpi::identify(self.transport.as_ref()).await
    }

    /// Front panel on, fixed (non-list) source mode.
    pub async fn initialize(&self) -> Result<()> {
        self.transport.write("DISP ON").await?;
        self.transport.write("SOURCE:FUNC:MODE FIX").await
    }
}

#[async_trait]
impl OutputControl for Keithley2200 {
    async fn enable_output(&self) -> Result<()> {
        self.transport.write("OUTP ON").await
    }

    async fn disable_output(&self) -> Result<()> {
        self.transport.write("OUTP OFF").await
    }

    async fn shutdown(&self) -> Result<()> {
        self.set_voltage(0.0).await?;
        self.disable_output().await
    }

    async fn beep(&self) -> Result<()> {
        self.transport.write("SYST:BEEP").await
    }
}

#[async_trait]
impl VoltageSource for Keithley2200 {
    async fn set_voltage(&self, volts: f64) -> Result<()> {
        self.transport.write(&format!("SOUR:VOLT {}", volts)).await
    }

    async fn set_current_limit(&self, amps: f64) -> Result<()> {
        self.transport.write(&format!("SOUR:CURR {}", amps)).await
    }
}

#[async_trait]
impl VoltageMeter for Keithley2200 {
    async fn measure_voltage(&self) -> Result<f64> {
        parse_f64_response(&self.transport.query("MEAS:VOLT?").await?)
    }
}

#[async_trait]
impl CurrentMeter for Keithley2200 {
    async fn measure_current(&self) -> Result<f64> {
        parse_f64_response(&self.transport.query("MEAS:CURR?").await?)
    }
}
