//! Error types for the ReachGuard environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A background task panicked or was cancelled by the runtime
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Every subscriber of a topic has been dropped
    #[error("Topic closed: {0}")]
    TopicClosed(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a task failure error.
    pub fn task(msg: impl Into<String>) -> Self {
        Self::TaskFailed(msg.into())
    }
}
