//! Raw SCPI over a TCP socket (LXI instruments, GPIB-Ethernet bridges).

use crate::error::DaqError;
use crate::hardware::scpi::ScpiTransport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::trace;

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Newline-terminated SCPI socket.
///
/// One command at a time: the connection is held behind a mutex for the
/// whole write/read exchange so replies cannot interleave.
pub struct TcpTransport {
    address: String,
    timeout: Duration,
    conn: Mutex<Connection>,
}

impl TcpTransport {
    /// Connect to `host:port`.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| DaqError::Timeout {
                command: format!("connect {}", address),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .with_context(|| format!("Failed to connect to {}", address))?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        tracing::debug!("Connected SCPI socket {}", address);
        Ok(Self {
            address: address.to_string(),
            timeout,
            conn: Mutex::new(Connection {
                reader: BufReader::new(read),
                writer: write,
            }),
        })
    }

    async fn send_line(conn: &mut Connection, command: &str) -> Result<()> {
        conn.writer.write_all(command.as_bytes()).await?;
        conn.writer.write_all(b"\n").await?;
        conn.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ScpiTransport for TcpTransport {
    async fn write(&self, command: &str) -> Result<()> {
        trace!(address = %self.address, "-> {}", command);
        let mut conn = self.conn.lock().await;
        Self::send_line(&mut conn, command)
            .await
            .with_context(|| format!("SCPI write '{}' to {} failed", command, self.address))
    }

    async fn query(&self, command: &str) -> Result<String> {
        trace!(address = %self.address, "-> {}", command);
        let mut conn = self.conn.lock().await;
        Self::send_line(&mut conn, command).await?;

        let mut line = String::new();
        let read = tokio::time::timeout(self.timeout, conn.reader.read_line(&mut line))
            .await
            .map_err(|_| DaqError::Timeout {
                command: command.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;
        if read == 0 {
            return Err(DaqError::Instrument(format!(
                "{} closed the connection during '{}'",
                self.address, command
            ))
            .into());
        }
        let reply = line.trim().to_string();
        trace!(address = %self.address, "<- {}", reply);
        Ok(reply)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn query_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (r, mut w) = sock.into_split();
            let mut lines = BufReader::new(r).lines();
            let mut seen = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                if line == "MEAS:CURR?" {
                    w.write_all(b"+1.5E-06\n").await.unwrap();
                }
                seen.push(line);
            }
            seen
        });

        let transport = TcpTransport::connect(&addr, Duration::from_secs(1))
            .await
            .unwrap();
        transport.write("OUTP ON").await.unwrap();
        assert_eq!(transport.query("MEAS:CURR?").await.unwrap(), "+1.5E-06");
        assert!(transport.describe().starts_with("tcp://127.0.0.1"));
        drop(transport);

        assert_eq!(server.await.unwrap(), vec!["OUTP ON", "MEAS:CURR?"]);
    }

    #[tokio::test]
    async fn silent_instrument_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });

        let transport = TcpTransport::connect(&addr, Duration::from_millis(50))
            .await
            .unwrap();
        let err = transport.query("*IDN?").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DaqError>(),
            Some(DaqError::Timeout { .. })
        ));
    }
}
