//! VISA transport for GPIB/USB/VXI-11 instruments.
//!
//! visa-rs is synchronous; every exchange runs on Tokio's blocking pool so a
//! slow GPIB reply never stalls the runtime.

use crate::error::DaqError;
use crate::hardware::scpi::ScpiTransport;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;
use visa_rs::prelude::*;

struct Session {
    // Sessions close when their resource manager is dropped.
    _rm: DefaultRM,
    instr: Instrument,
}

/// VISA session on one resource string, e.g. `GPIB0::24::INSTR`.
pub struct VisaTransport {
    resource: String,
    timeout: Duration,
    session: Arc<Mutex<Session>>,
}

impl VisaTransport {
    /// Open a session on `resource`.
    pub async fn open(resource: &str, timeout: Duration) -> Result<Self> {
        let resource_owned = resource.to_string();
        let session = tokio::task::spawn_blocking(move || -> Result<Session> {
            let rm = DefaultRM::new().map_err(|e| anyhow!("VISA resource manager: {}", e))?;
            let name = CString::new(resource_owned.as_str())
                .with_context(|| format!("Invalid VISA resource '{}'", resource_owned))?;
            let instr = rm
                .open(&name.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| anyhow!("Failed to open '{}': {}", resource_owned, e))?;
            Ok(Session { _rm: rm, instr })
        })
        .await
        .context("VISA open task panicked")??;

        tracing::debug!("Opened VISA resource {}", resource);
        Ok(Self {
            resource: resource.to_string(),
            timeout,
            session: Arc::new(Mutex::new(session)),
        })
    }

    async fn exchange(&self, command: &str, expect_reply: bool) -> Result<Option<String>> {
        let session = Arc::clone(&self.session);
        let line = format!("{}\n", command);
        let command_owned = command.to_string();
        let timeout_ms = self.timeout.as_millis() as u64;

        tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let mut guard = session
                .lock()
                .map_err(|_| anyhow!("VISA session lock poisoned"))?;
            guard
                .instr
                .write_all(line.as_bytes())
                .with_context(|| format!("VISA write '{}' failed", command_owned))?;
            if !expect_reply {
                return Ok(None);
            }
            let mut reply = String::new();
            BufReader::new(&guard.instr)
                .read_line(&mut reply)
                .map_err(|e| -> anyhow::Error {
                    if e.kind() == std::io::ErrorKind::TimedOut {
                        DaqError::Timeout {
                            command: command_owned.clone(),
                            timeout_ms,
                        }
                        .into()
                    } else {
                        anyhow!("VISA read after '{}' failed: {}", command_owned, e)
                    }
                })?;
            Ok(Some(reply.trim().to_string()))
        })
        .await
        .context("VISA I/O task panicked")?
    }
}

#[async_trait]
impl ScpiTransport for VisaTransport {
    async fn write(&self, command: &str) -> Result<()> {
        trace!(resource = %self.resource, "-> {}", command);
        self.exchange(command, false).await?;
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String> {
        trace!(resource = %self.resource, "-> {}", command);
        let reply = self.exchange(command, true).await?.unwrap_or_default();
        trace!(resource = %self.resource, "<- {}", reply);
        Ok(reply)
    }

    fn describe(&self) -> String {
        format!("visa://{}", self.resource)
    }
}
