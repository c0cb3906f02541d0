//! RS-232 transport.
//!
//! Serial I/O is blocking; each exchange runs on a dedicated blocking thread
//! and reads byte by byte until the newline delimiter.

use crate::error::DaqError;
use crate::hardware::scpi::ScpiTransport;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serialport::SerialPort;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;

/// Serial port speaking line-based SCPI.
pub struct SerialTransport {
    port_name: String,
    timeout: Duration,
    terminator: String,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl SerialTransport {
    /// Open `port_name` at `baud_rate`.
    pub async fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let name = port_name.to_string();
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&name, baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
                .with_context(|| format!("Failed to open serial port '{}' at {} baud", name, baud_rate))
        })
        .await
        .context("Serial open task panicked")??;

        tracing::debug!("Serial port '{}' opened at {} baud", port_name, baud_rate);
        Ok(Self {
            port_name: port_name.to_string(),
            timeout,
            terminator: "\n".to_string(),
            port: Arc::new(Mutex::new(port)),
        })
    }

    /// Set the command terminator (default `\n`).
    pub fn with_terminator(mut self, terminator: &str) -> Self {
        self.terminator = terminator.to_string();
        self
    }

    async fn exchange(&self, command: &str, expect_reply: bool) -> Result<Option<String>> {
        let port = Arc::clone(&self.port);
        let line = format!("{}{}", command, self.terminator);
        let command_owned = command.to_string();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            use std::io::{Read, Write};

            let mut guard = port
                .lock()
                .map_err(|_| anyhow!("Serial port lock poisoned"))?;
            guard
                .write_all(line.as_bytes())
                .context("Failed to write to serial port")?;
            guard.flush().context("Failed to flush serial port")?;
            if !expect_reply {
                return Ok(None);
            }

            let mut response = String::new();
            let mut buffer = [0u8; 1];
            let start = std::time::Instant::now();
            loop {
                if start.elapsed() > timeout {
                    return Err(DaqError::Timeout {
                        command: command_owned,
                        timeout_ms: timeout.as_millis() as u64,
                    }
                    .into());
                }
                match guard.read(&mut buffer) {
                    Ok(0) => return Err(anyhow!("Serial port returned EOF")),
                    Ok(_) => {
                        let ch = buffer[0] as char;
                        if ch == '\n' {
                            break;
                        }
                        response.push(ch);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(anyhow!("Serial read error: {}", e)),
                }
            }
            Ok(Some(response.trim().to_string()))
        })
        .await
        .context("Serial I/O task panicked")?
    }
}

#[async_trait]
impl ScpiTransport for SerialTransport {
    async fn write(&self, command: &str) -> Result<()> {
        trace!(port = %self.port_name, "-> {}", command);
        self.exchange(command, false).await?;
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String> {
        trace!(port = %self.port_name, "-> {}", command);
        let reply = self.exchange(command, true).await?.unwrap_or_default();
        trace!(port = %self.port_name, "<- {}", reply);
        Ok(reply)
    }

    fn describe(&self) -> String {
        format!("serial://{}", self.port_name)
    }
}
