//! # transport_daq
//!
//! Electrical transport measurements on SCPI source/meter instruments:
//! gate-voltage IV sweeps with a dwell at the extremum, anomalous Hall loops
//! driven by a bipolar coil supply, the combination of both, and constant
//! field holds.
//!
//! ## Crate Structure
//!
//! - **`sweep`**: setpoint arrays, the dwell schedule, progress and run-time estimates.
//! - **`hardware`**: capability traits (`VoltageSource`, `CurrentMeter`, ...), SCPI
//!   transports, the Keithley and Kepco drivers, simulated instruments and the
//!   `DeviceRegistry` that connects them from configuration.
//! - **`procedures`**: the `Procedure` trait, the built-in procedures, sequences and
//!   `execute_procedure_safely`, which guarantees the sources are switched off.
//! - **`data`**: result rows and sinks (CSV files, memory, progress logging).
//! - **`config`**: application configuration loaded with `figment`.
//! - **`telemetry`**: `tracing` subscriber setup.
//! - **`error`**: the `DaqError` enum.

pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod procedures;
pub mod sweep;
pub mod telemetry;

pub use error::{AppResult, DaqError};
