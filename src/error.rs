//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can occur while driving a sweep, from configuration issues to
//! instrument replies that cannot be parsed.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in the configuration files.
//! - **`Configuration`**: Semantic errors in the configuration that pass parsing but are
//!   logically incorrect (a zero sweep step, a duplicate instrument id).
//! - **`Io`**: Wraps `std::io::Error`, covering file and socket I/O.
//! - **`Instrument`**: Errors originating from instrument drivers.
//! - **`Timeout`**: An instrument did not answer a query in time.
//! - **`SafetyLimit`**: A requested output exceeds a hard limit of the connected hardware.
//! - **`Storage`**: Failures writing result files.
//! - **`Cancelled`**: The operator requested a stop.
//! - **`FeatureNotEnabled`**: Functionality that was not compiled in (e.g. VISA support).
//!
//! Capability traits and procedures return `anyhow::Result`; a `DaqError` can be
//! recovered from those with `downcast_ref` when the caller needs to tell variants apart.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application-wide error enum.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Instrument reported or caused an error.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Instrument did not reply within the transport timeout.
    #[error("Timed out after {timeout_ms} ms waiting for reply to '{command}'")]
    Timeout {
        /// Command that was waiting for a reply
        command: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Requested output exceeds the hardware limit.
    #[error("Safety limit exceeded: {0}")]
    SafetyLimit(String),

    /// Result file could not be written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operator requested a stop.
    #[error("Cancelled by user")]
    Cancelled,

    /// Functionality not compiled into this build.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for DaqError {
    fn from(value: csv::Error) -> Self {
        DaqError::Storage(value.to_string())
    }
}
