//! Keithley 2400-series SourceMeter driver (2400, 2410, 2450 in SCPI mode).
//!
//! The SMU sources either voltage or current and measures both. Readings are
//! taken with `:READ?` after `:FORM:ELEM VOLT,CURR`, so one trigger returns
//! the `voltage,current` pair.
//!
//! ```rust,ignore
//! let smu = Keithley24xx::new(transport, Keithley24xxConfig::default());
//! smu.reset().await?;
//! smu.set_remote_sense(true).await?;
//! smu.set_voltage_limit(5.0).await?;
//! smu.enable_output().await?;
//! smu.set_current(400e-6).await?;
//! let hall_v = smu.measure_voltage().await?;
//! ```

use crate::hardware::capabilities::{
    CurrentMeter, CurrentSource, OutputControl, VoltageMeter, VoltageSource,
};
use crate::hardware::scpi::{self, parse_f64_response, Identity, ScpiTransport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Terminal block used for the measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminals {
    /// Front panel banana jacks
    Front,
    /// Rear triax connectors
    Rear,
}

/// Quantity the SMU is forcing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFunction {
    /// Force voltage, limit current
    Voltage,
    /// Force current, limit voltage
    Current,
}

impl SourceFunction {
    fn to_u8(self) -> u8 {
        match self {
            SourceFunction::Voltage => 0,
            SourceFunction::Current => 1,
        }
    }

    fn from_u8(raw: u8) -> Self {
        if raw == 1 {
            SourceFunction::Current
        } else {
            SourceFunction::Voltage
        }
    }
}

fn default_nplc() -> f64 {
    1.0
}

fn default_beep_frequency() -> f64 {
    200.0
}

fn default_beep_duration() -> f64 {
    2.0
}

/// Static driver settings from the instrument definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keithley24xxConfig {
    /// Integration time in power-line cycles
    #[serde(default = "default_nplc")]
    pub nplc: f64,
    /// Remote sense (4-wire)
    #[serde(default)]
    pub four_wire: bool,
    /// Terminal block
    #[serde(default = "default_terminals")]
    pub terminals: Terminals,
    /// End-of-run beep frequency in Hz
    #[serde(default = "default_beep_frequency")]
    pub beep_frequency_hz: f64,
    /// End-of-run beep duration in s
    #[serde(default = "default_beep_duration")]
    pub beep_duration_s: f64,
}

fn default_terminals() -> Terminals {
    Terminals::Front
}

impl Default for Keithley24xxConfig {
    fn default() -> Self {
        Self {
            nplc: default_nplc(),
            four_wire: false,
            terminals: default_terminals(),
            beep_frequency_hz: default_beep_frequency(),
            beep_duration_s: default_beep_duration(),
        }
    }
}

/// Keithley 2400-series SourceMeter.
pub struct Keithley24xx {
    transport: Arc<dyn ScpiTransport>,
    config: Keithley24xxConfig,
    function: AtomicU8,
}

impl Keithley24xx {
    /// Wrap an open transport.
    pub fn new(transport: Arc<dyn ScpiTransport>, config: Keithley24xxConfig) -> Self {
        Self {
            transport,
            config,
            function: AtomicU8::new(SourceFunction::Voltage.to_u8()),
        }
    }

    /// Query `*IDN?`.
    pub async fn identify(&self) -> Result<Identity> {
        scpi::identify(self.transport.as_ref()).await
    }

    /// Return to power-on defaults and clear the status model.
    pub async fn reset(&self) -> Result<()> {
        self.transport.write("*RST").await?;
        self.transport.write(":STAT:PRES").await?;
        self.transport.write("*CLS").await?;
        self.function
            .store(SourceFunction::Voltage.to_u8(), Ordering::SeqCst);
        Ok(())
    }

    /// Reset and apply the configured sense mode, terminals and readings format.
    pub async fn initialize(&self) -> Result<()> {
        self.reset().await?;
        self.set_four_wire(self.config.four_wire).await?;
        self.set_terminals(self.config.terminals).await?;
        self.configure_readings().await
    }

    /// Enable (4-wire) or disable (2-wire) remote sense.
    pub async fn set_four_wire(&self, enabled: bool) -> Result<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.transport.write(&format!(":SYST:RSEN {}", state)).await
    }

    /// Select front or rear terminals.
    pub async fn set_terminals(&self, terminals: Terminals) -> Result<()> {
        let which = match terminals {
            Terminals::Front => "FRON",
            Terminals::Rear => "REAR",
        };
        self.transport.write(&format!(":ROUT:TERM {}", which)).await
    }

    /// Measure voltage and current on every trigger, returned as `V,I`.
    pub async fn configure_readings(&self) -> Result<()> {
        let nplc = self.config.nplc;
        self.transport.write(":SENS:FUNC:CONC ON").await?;
        self.transport.write(":SENS:FUNC 'VOLT','CURR'").await?;
        self.transport
            .write(&format!(":SENS:VOLT:NPLC {}", nplc))
            .await?;
        self.transport
            .write(&format!(":SENS:CURR:NPLC {}", nplc))
            .await?;
        self.transport.write(":FORM:ELEM VOLT,CURR").await
    }

    /// Switch the source function (fixed mode) if it is not already active.
    pub async fn select_function(&self, function: SourceFunction) -> Result<()> {
        if self.source_function() == function {
            return Ok(());
        }
        let (func, mode) = match function {
            SourceFunction::Voltage => (":SOUR:FUNC VOLT", ":SOUR:VOLT:MODE FIX"),
            SourceFunction::Current => (":SOUR:FUNC CURR", ":SOUR:CURR:MODE FIX"),
        };
        self.transport.write(func).await?;
        self.transport.write(mode).await?;
        self.function.store(function.to_u8(), Ordering::SeqCst);
        Ok(())
    }

    /// Quantity currently being sourced.
    pub fn source_function(&self) -> SourceFunction {
        SourceFunction::from_u8(self.function.load(Ordering::SeqCst))
    }

    /// One triggered `(voltage, current)` reading.
    pub async fn read_pair(&self) -> Result<(f64, f64)> {
        let reply = self.transport.query(":READ?").await?;
        let mut fields = reply.split(',');
        let voltage = parse_f64_response(fields.next().unwrap_or_default())?;
        let current = fields
            .next()
            .map(parse_f64_response)
            .transpose()?
            .with_context(|| format!("Expected 'V,I' from :READ?, got '{}'", reply))?;
        Ok((voltage, current))
    }

    /// Sound the beeper.
    pub async fn beep_with(&self, frequency_hz: f64, duration_s: f64) -> Result<()> {
        self.transport
            .write(&format!(":SYST:BEEP {}, {}", frequency_hz, duration_s))
            .await
    }
}

#[async_trait]
impl OutputControl for Keithley24xx {
    async fn enable_output(&self) -> Result<()> {
        self.transport.write(":OUTP ON").await
    }

    async fn disable_output(&self) -> Result<()> {
        self.transport.write(":OUTP OFF").await
    }

    async fn shutdown(&self) -> Result<()> {
        match self.source_function() {
            SourceFunction::Voltage => self.set_voltage(0.0).await?,
            SourceFunction::Current => self.set_current(0.0).await?,
        }
        self.disable_output().await
    }

    async fn beep(&self) -> Result<()> {
        self.beep_with(self.config.beep_frequency_hz, self.config.beep_duration_s)
            .await
    }
}

#[async_trait]
impl VoltageSource for Keithley24xx {
    async fn set_voltage(&self, volts: f64) -> Result<()> {
        self.select_function(SourceFunction::Voltage).await?;
        self.transport
            .write(&format!(":SOUR:VOLT:LEV {}", volts))
            .await
    }

    async fn set_current_limit(&self, amps: f64) -> Result<()> {
        self.transport
            .write(&format!(":SENS:CURR:PROT {}", amps))
            .await
    }
}

#[async_trait]
impl CurrentSource for Keithley24xx {
    async fn set_current(&self, amps: f64) -> Result<()> {
        self.select_function(SourceFunction::Current).await?;
        self.transport
            .write(&format!(":SOUR:CURR:LEV {}", amps))
            .await
    }

    async fn set_voltage_limit(&self, volts: f64) -> Result<()> {
        self.transport
            .write(&format!(":SENS:VOLT:PROT {}", volts))
            .await
    }
}

#[async_trait]
impl VoltageMeter for Keithley24xx {
    async fn measure_voltage(&self) -> Result<f64> {
        Ok(self.read_pair().await?.0)
    }

    async fn set_remote_sense(&self, four_wire: bool) -> Result<()> {
        self.set_four_wire(four_wire).await
    }
}

#[async_trait]
impl CurrentMeter for Keithley24xx {
    async fn measure_current(&self) -> Result<f64> {
        Ok(self.read_pair().await?.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::transport::MockTransport;

    fn smu() -> (Arc<MockTransport>, Keithley24xx) {
        let mock = Arc::new(MockTransport::new());
        let driver = Keithley24xx::new(mock.clone(), Keithley24xxConfig::default());
        (mock, driver)
    }

    #[tokio::test]
    async fn current_source_setup_sequence() {
        let (mock, smu) = smu();
        smu.reset().await.unwrap();
        smu.set_four_wire(true).await.unwrap();
        smu.set_terminals(Terminals::Front).await.unwrap();
        smu.select_function(SourceFunction::Current).await.unwrap();
        smu.set_voltage_limit(5.0).await.unwrap();
        smu.enable_output().await.unwrap();
        assert_eq!(
            mock.call_log(),
            vec![
                "*RST",
                ":STAT:PRES",
                "*CLS",
                ":SYST:RSEN ON",
                ":ROUT:TERM FRON",
                ":SOUR:FUNC CURR",
                ":SOUR:CURR:MODE FIX",
                ":SENS:VOLT:PROT 5",
                ":OUTP ON",
            ]
        );
        assert_eq!(smu.source_function(), SourceFunction::Current);
    }

    #[tokio::test]
    async fn reads_voltage_current_pair() {
        let (mock, smu) = smu();
        mock.push_reply(":READ?", "+1.000000E-01,+2.000000E-07");
        mock.push_reply(":READ?", "+1.000000E-01,+2.000000E-07");
        assert_eq!(smu.measure_voltage().await.unwrap(), 0.1);
        assert_eq!(smu.measure_current().await.unwrap(), 2e-7);
    }

    #[tokio::test]
    async fn single_field_reading_is_an_error() {
        let (mock, smu) = smu();
        mock.push_reply(":READ?", "+1.0E-01");
        assert!(smu.read_pair().await.is_err());
    }

    #[tokio::test]
    async fn shutdown_zeroes_active_function() {
        let (mock, smu) = smu();
        smu.select_function(SourceFunction::Voltage).await.unwrap();
        mock.clear_call_log();
        smu.shutdown().await.unwrap();
        assert_eq!(mock.call_log(), vec![":SOUR:VOLT:LEV 0", ":OUTP OFF"]);

        smu.select_function(SourceFunction::Current).await.unwrap();
        mock.clear_call_log();
        smu.shutdown().await.unwrap();
        assert_eq!(mock.call_log(), vec![":SOUR:CURR:LEV 0", ":OUTP OFF"]);
    }

    #[tokio::test]
    async fn remote_sense_switches_sense_mode() {
        let (mock, smu) = smu();
        let meter: &dyn VoltageMeter = &smu;
        meter.set_remote_sense(true).await.unwrap();
        meter.set_remote_sense(false).await.unwrap();
        assert_eq!(mock.call_log(), vec![":SYST:RSEN ON", ":SYST:RSEN OFF"]);
    }

    #[tokio::test]
    async fn beep_uses_configured_tone() {
        let (mock, smu) = smu();
        smu.beep().await.unwrap();
        assert_eq!(mock.call_log(), vec![":SYST:BEEP 200, 2"]);
    }
}
