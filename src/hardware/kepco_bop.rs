//! Kepco BOP bipolar power supply driving the electromagnet coil.
//!
//! Operated in current mode. The coil current sets the applied field, so the
//! driver refuses setpoints at or beyond `max_current_a` and drops the output
//! to zero instead of clamping.

use crate::error::DaqError;
use crate::hardware::capabilities::{CurrentMeter, CurrentSource, OutputControl};
use crate::hardware::scpi::{self, parse_f64_response, Identity, ScpiTransport};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Coil currents at or above this magnitude are refused.
pub const DEFAULT_MAX_CURRENT_A: f64 = 29.0;

fn default_voltage_limit() -> f64 {
    20.0
}

fn default_max_current() -> f64 {
    DEFAULT_MAX_CURRENT_A
}

/// Static driver settings from the instrument definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KepcoBopConfig {
    /// Voltage compliance in current mode
    #[serde(default = "default_voltage_limit")]
    pub voltage_limit_v: f64,
    /// Hard coil-current limit
    #[serde(default = "default_max_current")]
    pub max_current_a: f64,
}

impl Default for KepcoBopConfig {
    fn default() -> Self {
        Self {
            voltage_limit_v: default_voltage_limit(),
            max_current_a: default_max_current(),
        }
    }
}

/// Kepco BOP in current mode.
pub struct KepcoBop {
    transport: Arc<dyn ScpiTransport>,
    config: KepcoBopConfig,
}

impl KepcoBop {
    /// Wrap an open transport.
    pub fn new(transport: Arc<dyn ScpiTransport>, config: KepcoBopConfig) -> Self {
        Self { transport, config }
    }

    /// Hard coil-current limit in amperes.
    pub fn max_current(&self) -> f64 {
        self.config.max_current_a
    }

    /// Query `*IDN?`.
    pub async fn identify(&self) -> Result<Identity> {
        scpi::identify(self.transport.as_ref()).await
    }

    /// Reset into current mode with the output on at 0 A.
    pub async fn initialize(&self) -> Result<()> {
        self.transport.write("*RST").await?;
        self.transport.write("FUNC:MODE CURR").await?;
        self.set_voltage_limit(self.config.voltage_limit_v).await?;
        self.transport.write("OUTPUT ON; CURR 0.0").await?;
        info!("Kepco BOP ready on {}", self.transport.describe());
        Ok(())
    }

    /// Drive the coil to 0 A without touching the output state.
    pub async fn zero(&self) -> Result<()> {
        self.transport.write("CURR 0.0").await
    }
}

#[async_trait]
impl OutputControl for KepcoBop {
    async fn enable_output(&self) -> Result<()> {
        self.transport.write("OUTPUT ON").await
    }

    async fn disable_output(&self) -> Result<()> {
        self.transport.write("OUTPUT OFF").await
    }

    async fn shutdown(&self) -> Result<()> {
        self.zero().await?;
        self.disable_output().await
    }

    async fn beep(&self) -> Result<()> {
        self.transport.write("SYSTem:BEEP").await
    }
}

#[async_trait]
impl CurrentSource for KepcoBop {
    async fn set_current(&self, amps: f64) -> Result<()> {
        if !amps.is_finite() || amps.abs() >= self.config.max_current_a {
            error!(
                "Coil current {} A refused (limit {} A), zeroing output",
                amps, self.config.max_current_a
            );
            self.zero().await?;
            return Err(DaqError::SafetyLimit(format!(
                "coil current {} A is at or above the {} A limit",
                amps, self.config.max_current_a
            ))
            .into());
        }
        self.transport.write(&format!("CURR {:.6}", amps)).await
    }

    async fn set_voltage_limit(&self, volts: f64) -> Result<()> {
        self.transport.write(&format!("VOLT {:.1}", volts)).await
    }
}

#[async_trait]
impl CurrentMeter for KepcoBop {
    async fn measure_current(&self) -> Result<f64> {
        parse_f64_response(&self.transport.query("MEAS:CURR?").await?)
    }
}
