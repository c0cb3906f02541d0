//! Common SCPI communication abstractions.
//!
//! Every driver in this crate talks SCPI text over some transport. The
//! transport only moves lines; drivers own the command vocabulary.

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Trait for SCPI communication transports.
///
/// Abstracts the underlying bus (GPIB via VISA, raw TCP socket, RS-232) so
/// drivers are protocol-agnostic. Implementations append the line terminator
/// and trim the reply.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a command without expecting a response.
    async fn write(&self, command: &str) -> Result<()>;

    /// Send a query command and return the trimmed response.
    async fn query(&self, command: &str) -> Result<String>;

    /// Human-readable description of the endpoint (for logs).
    fn describe(&self) -> String;
}

/// Parse a floating-point response from SCPI query.
pub fn parse_f64_response(response: &str) -> Result<f64> {
    response
        .trim()
        .parse::<f64>()
        .with_context(|| format!("Failed to parse SCPI response as f64: '{}'", response))
}

/// Parse the first field of a comma-separated reading.
///
/// `:READ?` on a Keithley 2400 returns `V,I,R,time,status`; only the first
/// element is the value selected with `:FORM:ELEM`.
pub fn parse_first_f64(response: &str) -> Result<f64> {
    let first = response.split(',').next().unwrap_or_default();
    parse_f64_response(first)
}

static IDN_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^\s*([^,]+?)\s*,\s*([^,]+?)\s*,\s*([^,]*?)\s*,\s*(.*?)\s*$").ok()
});

/// Parsed `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Manufacturer, e.g. `KEITHLEY INSTRUMENTS INC.`
    pub manufacturer: String,
    /// Model, e.g. `MODEL 2400`
    pub model: String,
    /// Serial number (may be `0`)
    pub serial: String,
    /// Firmware revision string
    pub firmware: String,
}

impl Identity {
    /// Parse `manufacturer,model,serial,firmware`.
    pub fn parse(reply: &str) -> Result<Self> {
        let pattern = IDN_PATTERN
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("IDN pattern failed to compile"))?;
        let caps = pattern
            .captures(reply)
            .ok_or_else(|| anyhow::anyhow!("Unrecognised *IDN? reply: '{}'", reply.trim()))?;
        Ok(Self {
            manufacturer: caps[1].to_string(),
            model: caps[2].to_string(),
            serial: caps[3].to_string(),
            firmware: caps[4].to_string(),
        })
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} (s/n {})", self.manufacturer, self.model, self.serial)
    }
}

/// Query `*IDN?` and parse it.
pub async fn identify(transport: &dyn ScpiTransport) -> Result<Identity> {
    let reply = transport.query("*IDN?").await?;
    Identity::parse(&reply)
}
