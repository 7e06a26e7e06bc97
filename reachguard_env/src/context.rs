//! Core execution context trait for ReachGuard components.

use crate::error::EnvError;
use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for interaction with time and the scheduler.
///
/// This trait abstracts the "real world" so that the supervision loop can run
/// in both production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `tokio::task`
/// - **Simulation**: `SimContext` - manual virtual clock, inline execution
#[async_trait]
pub trait SupervisorContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for command freshness windows and control-cycle bookkeeping.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// Time-triggered obstacles compare their deadline against this clock.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Runs a computationally heavy closure away from the event handlers.
    ///
    /// In production this is a dedicated blocking thread so that update
    /// handlers and control cycles never wait on it. In simulation the
    /// closure runs inline to keep execution deterministic.
    async fn run_blocking<F, R>(&self, f: F) -> Result<R, EnvError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static;
}
