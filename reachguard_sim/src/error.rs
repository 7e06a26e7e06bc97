//! Simulation harness errors.

use rand_distr::NormalError;
use reachguard_core::{RequestError, SupervisorError};
use thiserror::Error;

/// Anything that aborts a scenario before its checks complete.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("supervisor: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("request rejected: {0}")]
    Request(#[from] RequestError),

    #[error("plant noise: {0}")]
    Noise(#[from] NormalError),

    #[error("runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("scenario setup: {0}")]
    Setup(String),
}
