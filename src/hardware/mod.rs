//! Instrument access
//!
//! Capability traits, the SCPI transport layer, concrete drivers for the
//! bench instruments, simulated stand-ins and the device registry that
//! connects them from configuration.

pub mod capabilities;
pub mod keithley2200;
pub mod keithley24xx;
pub mod kepco_bop;
pub mod registry;
pub mod scpi;
pub mod simulated;
pub mod transport;

pub use capabilities::{CurrentMeter, CurrentSource, OutputControl, VoltageMeter, VoltageSource};
pub use keithley2200::Keithley2200;
pub use keithley24xx::{Keithley24xx, Keithley24xxConfig, SourceFunction, Terminals};
pub use kepco_bop::{KepcoBop, KepcoBopConfig};
pub use registry::{Capability, DeviceConfig, DeviceHandles, DeviceRegistry, DriverType};
pub use scpi::{Identity, ScpiTransport};
pub use simulated::{SampleParameters, SimulatedFieldSupply, SimulatedSample, SimulatedSourceMeter};
pub use transport::TransportConfig;
