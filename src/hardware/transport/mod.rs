//! Instrument bus transports.
//!
//! | Transport         | Bus                         | Feature             |
//! |-------------------|-----------------------------|---------------------|
//! | [`TcpTransport`]  | raw SCPI socket (port 5025) | always              |
//! | `VisaTransport`   | GPIB / USB-TMC / VXI-11     | `instrument_visa`   |
//! | `SerialTransport` | RS-232                      | `instrument_serial` |
//! | [`MockTransport`] | scripted replies            | always              |
//!
//! [`open`] builds the right transport from a [`TransportConfig`].

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod tcp;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use mock::MockTransport;
#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;
pub use tcp::TcpTransport;
#[cfg(feature = "instrument_visa")]
pub use visa::VisaTransport;

use super::scpi::ScpiTransport;
use crate::error::DaqError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Default reply timeout for every transport.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_terminator() -> String {
    "\n".to_string()
}

/// How to reach an instrument.
///
/// ```toml
/// [instruments.config.transport]
/// kind = "visa"
/// resource = "GPIB0::24::INSTR"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// VISA resource string (GPIB, USB, VXI-11)
    Visa {
        /// e.g. `GPIB0::24::INSTR`
        resource: String,
        /// Reply timeout
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// Raw SCPI over TCP
    Tcp {
        /// `host:port`
        address: String,
        /// Reply timeout
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// RS-232
    Serial {
        /// e.g. `/dev/ttyUSB0`
        port: String,
        /// Line speed
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Command terminator
        #[serde(default = "default_terminator")]
        terminator: String,
        /// Reply timeout
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

impl TransportConfig {
    /// Endpoint string for logs.
    pub fn endpoint(&self) -> &str {
        match self {
            TransportConfig::Visa { resource, .. } => resource,
            TransportConfig::Tcp { address, .. } => address,
            TransportConfig::Serial { port, .. } => port,
        }
    }
}

/// Open the transport described by `config`.
pub async fn open(config: &TransportConfig) -> Result<Arc<dyn ScpiTransport>> {
    match config {
        TransportConfig::Tcp {
            address,
            timeout_ms,
        } => {
            let transport =
                TcpTransport::connect(address, Duration::from_millis(*timeout_ms)).await?;
            Ok(Arc::new(transport))
        }
        TransportConfig::Visa {
            resource,
            timeout_ms,
        } => open_visa(resource, *timeout_ms).await,
        TransportConfig::Serial {
            port,
            baud_rate,
            terminator,
            timeout_ms,
        } => open_serial(port, *baud_rate, terminator, *timeout_ms).await,
    }
}

#[cfg(feature = "instrument_visa")]
async fn open_visa(resource: &str, timeout_ms: u64) -> Result<Arc<dyn ScpiTransport>> {
    let transport = VisaTransport::open(resource, Duration::from_millis(timeout_ms)).await?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "instrument_visa"))]
async fn open_visa(_resource: &str, _timeout_ms: u64) -> Result<Arc<dyn ScpiTransport>> {
    Err(DaqError::FeatureNotEnabled("instrument_visa".into()).into())
}

#[cfg(feature = "instrument_serial")]
async fn open_serial(
    port: &str,
    baud_rate: u32,
    terminator: &str,
    timeout_ms: u64,
) -> Result<Arc<dyn ScpiTransport>> {
    let transport = SerialTransport::open(port, baud_rate, Duration::from_millis(timeout_ms))
        .await?
        .with_terminator(terminator);
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "instrument_serial"))]
async fn open_serial(
    _port: &str,
    _baud_rate: u32,
    _terminator: &str,
    _timeout_ms: u64,
) -> Result<Arc<dyn ScpiTransport>> {
    Err(DaqError::FeatureNotEnabled("instrument_serial".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_config_from_toml() {
        let visa: TransportConfig =
            toml::from_str("kind = \"visa\"\nresource = \"GPIB0::24::INSTR\"").unwrap();
        assert_eq!(
            visa,
            TransportConfig::Visa {
                resource: "GPIB0::24::INSTR".into(),
                timeout_ms: DEFAULT_TIMEOUT_MS,
            }
        );
        assert_eq!(visa.endpoint(), "GPIB0::24::INSTR");

        let serial: TransportConfig =
            toml::from_str("kind = \"serial\"\nport = \"/dev/ttyUSB0\"").unwrap();
        match serial {
            TransportConfig::Serial {
                baud_rate,
                terminator,
                ..
            } => {
                assert_eq!(baud_rate, 9600);
                assert_eq!(terminator, "\n");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn visa_without_feature_is_reported() {
        let cfg = TransportConfig::Visa {
            resource: "GPIB0::5::INSTR".into(),
            timeout_ms: 100,
        };
        let err = open(&cfg).await.err().unwrap();
        assert!(err.to_string().contains("instrument_visa"));
    }
}
