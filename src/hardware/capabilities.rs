//! Atomic Hardware Capabilities
//!
//! Source/meter instruments are described by the small capability traits they
//! actually support instead of one trait per model:
//!
//! - a Keithley 2400 SMU implements all of them (it sources either quantity
//!   and measures either quantity);
//! - a Keithley 2200 supply implements `VoltageSource + VoltageMeter + CurrentMeter`;
//! - a Kepco BOP coil supply implements `CurrentSource + CurrentMeter`.
//!
//! Procedures ask the registry for the capability a role needs, so the same
//! gate sweep runs against an SMU or a plain bench supply.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Works in SI units (volts, amperes)
//!
//! # Example
//!
//! ```rust,ignore
//! async fn iv_point<S, M>(source: &S, meter: &M, volts: f64) -> Result<(f64, f64)>
//! where
//!     S: VoltageSource + ?Sized,
//!     M: CurrentMeter + ?Sized,
//! {
//!     source.set_voltage(volts).await?;
//!     Ok((volts, meter.measure_current().await?))
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

/// Capability: Output Switching
///
/// Every source can switch its output terminals on and off.
///
/// # Contract
/// - `shutdown` leaves the output at zero and disabled; it is called on
///   cancellation, on error and at the end of every run
/// - `beep` is best effort and a no-op on instruments without a beeper
#[async_trait]
pub trait OutputControl: Send + Sync {
    /// Connect the output terminals.
    async fn enable_output(&self) -> Result<()>;

    /// Disconnect the output terminals.
    async fn disable_output(&self) -> Result<()>;

    /// Bring the output to zero and disable it.
    ///
    /// # Default Implementation
    /// Only disables the output. Sources override this to zero their
    /// setpoint first.
    async fn shutdown(&self) -> Result<()> {
        self.disable_output().await
    }

    /// Audible end-of-run notification.
    async fn beep(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability: Voltage Sourcing
///
/// Devices that force a voltage with a current compliance (SMUs, DC supplies).
#[async_trait]
pub trait VoltageSource: OutputControl {
    /// Set the output voltage in volts.
    async fn set_voltage(&self, volts: f64) -> Result<()>;

    /// Set the current compliance in amperes.
    async fn set_current_limit(&self, amps: f64) -> Result<()>;
}

/// Capability: Current Sourcing
///
/// Devices that force a current with a voltage compliance (SMUs, coil supplies).
///
/// # Contract
/// - Drivers with a hard output limit reject setpoints beyond it with
///   [`DaqError::SafetyLimit`](crate::error::DaqError::SafetyLimit) and leave
///   the output at zero
#[async_trait]
pub trait CurrentSource: OutputControl {
    /// Set the output current in amperes.
    async fn set_current(&self, amps: f64) -> Result<()>;

    /// Set the voltage compliance in volts.
    async fn set_voltage_limit(&self, volts: f64) -> Result<()>;
}

/// Capability: Voltage Measurement
#[async_trait]
pub trait VoltageMeter: Send + Sync {
    /// Trigger and return one voltage reading in volts.
    async fn measure_voltage(&self) -> Result<f64>;

    /// Select 4-wire (remote sense) or 2-wire voltage measurement.
    ///
    /// No-op on meters without separate sense terminals.
    async fn set_remote_sense(&self, _four_wire: bool) -> Result<()> {
        Ok(())
    }
}

/// Capability: Current Measurement
#[async_trait]
pub trait CurrentMeter: Send + Sync {
    /// Trigger and return one current reading in amperes.
    async fn measure_current(&self) -> Result<f64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl OutputControl for Recorder {
        async fn enable_output(&self) -> Result<()> {
            self.calls.lock().unwrap().push("on");
            Ok(())
        }

        async fn disable_output(&self) -> Result<()> {
            self.calls.lock().unwrap().push("off");
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_shutdown_disables_output() {
        let dev = Recorder::default();
        dev.enable_output().await.unwrap();
        dev.shutdown().await.unwrap();
        dev.beep().await.unwrap();
        assert_eq!(*dev.calls.lock().unwrap(), vec!["on", "off"]);
    }

    #[async_trait]
    impl VoltageMeter for Recorder {
        async fn measure_voltage(&self) -> Result<f64> {
            self.calls.lock().unwrap().push("read");
            Ok(0.0)
        }
    }

    #[tokio::test]
    async fn default_remote_sense_sends_nothing() {
        let dev = Recorder::default();
        dev.set_remote_sense(true).await.unwrap();
        assert!(dev.calls.lock().unwrap().is_empty());
    }
}
