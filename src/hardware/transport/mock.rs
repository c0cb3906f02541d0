//! Mock transport for testing drivers without hardware.
//!
//! Provides:
//! - Scripted replies per query (FIFO, falling back to a fixed reply)
//! - Controllable failure injection
//! - Call logging for test verification

use crate::hardware::scpi::ScpiTransport;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Scripted SCPI endpoint.
///
/// # Example
///
/// ```
/// use transport_daq::hardware::scpi::ScpiTransport;
/// use transport_daq::hardware::transport::MockTransport;
///
/// # tokio_test_block(async {
/// let mock = MockTransport::new().with_reply("MEAS:CURR?", "1.0E-6");
/// mock.write("OUTP ON").await.unwrap();
/// assert_eq!(mock.query("MEAS:CURR?").await.unwrap(), "1.0E-6");
/// assert_eq!(mock.call_log(), vec!["OUTP ON", "MEAS:CURR?"]);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
#[derive(Default)]
pub struct MockTransport {
    fixed: Mutex<HashMap<String, String>>,
    queued: Mutex<HashMap<String, VecDeque<String>>>,
    call_log: Mutex<Vec<String>>,
    should_fail_next: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    /// Empty mock. Unscripted queries reply `0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `query` with `reply`.
    pub fn with_reply(self, query: &str, reply: &str) -> Self {
        lock(&self.fixed).insert(query.to_string(), reply.to_string());
        self
    }

    /// Queue one reply for `query`; queued replies are used before the fixed one.
    pub fn push_reply(&self, query: &str, reply: &str) {
        lock(&self.queued)
            .entry(query.to_string())
            .or_default()
            .push_back(reply.to_string());
    }

    /// Fail the next write or query.
    pub fn trigger_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Every command seen so far, in order.
    pub fn call_log(&self) -> Vec<String> {
        lock(&self.call_log).clone()
    }

    /// Commands seen that start with `prefix`.
    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        lock(&self.call_log)
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Forget the call log.
    pub fn clear_call_log(&self) {
        lock(&self.call_log).clear();
    }

    fn record(&self, command: &str) -> Result<()> {
        lock(&self.call_log).push(command.to_string());
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("Mock transport failure on '{}'", command);
        }
        Ok(())
    }
}

#[async_trait]
impl ScpiTransport for MockTransport {
    async fn write(&self, command: &str) -> Result<()> {
        self.record(command)
    }

    async fn query(&self, command: &str) -> Result<String> {
        self.record(command)?;
        if let Some(reply) = lock(&self.queued)
            .get_mut(command)
            .and_then(|q| q.pop_front())
        {
            return Ok(reply);
        }
        Ok(lock(&self.fixed)
            .get(command)
            .cloned()
            .unwrap_or_else(|| "0".to_string()))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
