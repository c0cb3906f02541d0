//! Leaving sources in a safe state.
//!
//! A sweep that stops halfway (cancel, instrument error, panic) must not leave
//! a gate biased or a coil energized. Three pieces cover this:
//!
//! - [`PanicGuard`]: RAII guard that runs synchronous cleanup on drop
//! - [`EmergencyStopFlag`]: shared flag a guard sets when a procedure panics
//! - [`SafeShutdown`]: the async list of outputs to zero and disable, in order
//!
//! ```rust,ignore
//! let mut safe = SafeShutdown::new();
//! safe.register("gate", ctx.get_output("source").await?);
//!
//! // ... sweep ...
//!
//! safe.run_all().await; // zeroes and disables every registered output
//! ```

use crate::hardware::capabilities::OutputControl;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A synchronous RAII guard that executes cleanup when dropped.
///
/// The cleanup cannot await; use it to set flags and log. Hardware shutdown
/// goes through [`SafeShutdown`].
pub struct PanicGuard {
    cleanup: Option<Box<dyn FnOnce() + Send + 'static>>,
    name: String,
}

impl PanicGuard {
    /// Create a named panic guard.
    pub fn named<F>(name: impl Into<String>, cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cleanup: Some(Box::new(cleanup)),
            name: name.into(),
        }
    }

    /// Dismiss the guard without running cleanup.
    pub fn dismiss(mut self) {
        self.cleanup = None;
    }

    pub fn is_armed(&self) -> bool {
        self.cleanup.is_some()
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        if std::thread::panicking() {
            tracing::error!(guard = %self.name, "Panic during procedure, running cleanup");
        }
        // A panicking cleanup would abort the process.
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(cleanup)).is_err() {
            tracing::error!(guard = %self.name, "Cleanup itself panicked");
        }
    }
}

/// A shared flag for signaling emergency stops across tasks.
#[derive(Clone, Default)]
pub struct EmergencyStopFlag {
    flag: Arc<AtomicBool>,
    reason: Arc<std::sync::RwLock<Option<String>>>,
}

impl EmergencyStopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the emergency stop.
    pub fn trigger(&self, reason: impl Into<String>) {
        self.flag.store(true, Ordering::SeqCst);
        if let Ok(mut r) = self.reason.write() {
            *r = Some(reason.into());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.read().ok().and_then(|r| r.clone())
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
        if let Ok(mut r) = self.reason.write() {
            *r = None;
        }
    }

    /// A guard that triggers this flag if dropped while armed.
    pub fn guard(&self, context: impl Into<String>) -> PanicGuard {
        let flag = self.clone();
        let context = context.into();
        PanicGuard::named(context.clone(), move || {
            flag.trigger(format!("Panic in: {}", context));
        })
    }
}

/// Outputs to bring to a safe state, shut down in registration order.
#[derive(Default)]
pub struct SafeShutdown {
    outputs: Vec<(String, Arc<dyn OutputControl>)>,
}

impl SafeShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an output. Registering the same name twice keeps the first.
    pub fn register(&mut self, name: impl Into<String>, output: Arc<dyn OutputControl>) {
        let name = name.into();
        if !self.outputs.iter().any(|(n, _)| *n == name) {
            self.outputs.push((name, output));
        }
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Shut every output down. Failures are logged and do not stop the rest.
    ///
    /// Returns the names of the outputs that failed.
    pub async fn run_all(&self) -> Vec<String> {
        let mut failed = Vec::new();
        for (name, output) in &self.outputs {
            match output.shutdown().await {
                Ok(()) => tracing::info!(output = %name, "Output zeroed and disabled"),
                Err(e) => {
                    tracing::error!(output = %name, error = %e, "Failed to shut output down");
                    failed.push(name.clone());
                }
            }
        }
        failed
    }

    /// Beep every output that supports it; errors are ignored.
    pub async fn beep_all(&self) {
        for (name, output) in &self.outputs {
            if let Err(e) = output.beep().await {
                tracing::debug!(output = %name, error = %e, "Beep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulated::{SimulatedFieldSupply, SimulatedSample, SimulatedSourceMeter};
    use crate::hardware::capabilities::{CurrentSource, VoltageSource};

    #[test]
    fn guard_runs_on_drop_unless_dismissed() {
        let flag = EmergencyStopFlag::new();
        {
            let _guard = flag.guard("gate_sweep");
        }
        assert!(flag.is_triggered());
        assert_eq!(flag.reason().as_deref(), Some("Panic in: gate_sweep"));

        flag.reset();
        let guard = flag.guard("hall_sweep");
        assert!(guard.is_armed());
        guard.dismiss();
        assert!(!flag.is_triggered());
        assert!(flag.reason().is_none());
    }

    #[test]
    fn guard_triggers_during_panic() {
        let flag = EmergencyStopFlag::new();
        let inner = flag.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = inner.guard("boom");
            panic!("instrument exploded");
        });
        assert!(result.is_err());
        assert!(flag.is_triggered());
    }

    #[tokio::test]
    async fn safe_shutdown_zeroes_every_output() {
        let sample = Arc::new(SimulatedSample::default());
        let smu = Arc::new(SimulatedSourceMeter::new(sample.clone()));
        let coil = Arc::new(SimulatedFieldSupply::new(sample));

        smu.enable_output().await.unwrap();
        smu.set_voltage(1.5).await.unwrap();
        coil.enable_output().await.unwrap();
        coil.set_current(2.0).await.unwrap();

        let mut safe = SafeShutdown::new();
        safe.register("gate", smu.clone());
        safe.register("coil", coil.clone());
        safe.register("gate", smu.clone());
        assert_eq!(safe.len(), 2);

        let failed = safe.run_all().await;
        assert!(failed.is_empty());
        assert!(!smu.is_output_enabled());
        assert_eq!(smu.level(), 0.0);
        assert_eq!(coil.level(), 0.0);
    }
}
