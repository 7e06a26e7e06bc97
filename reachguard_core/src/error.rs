//! Error taxonomy for the supervisor.
//!
//! Component-local faults (bound inconsistency, shape mismatch) are contained
//! by the refinement loop and surfaced as a stale certificate; everything else
//! is returned to the caller as a structured result.

use reachguard_env::EnvError;
use thiserror::Error;

/// Inconsistent or mismatched configuration. Fatal to the refinement loop
/// until corrected, never to the process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationFault {
    /// `lo > hi` on some axis (or a non-finite bound)
    #[error("inconsistent {set} bounds on axis {axis}: lo={lo} hi={hi}")]
    InconsistentBounds {
        set: String,
        axis: usize,
        lo: f64,
        hi: f64,
    },

    /// Vector length does not match the model dimension
    #[error("{what}: expected dimension {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// Dense array does not match the grid shape
    #[error("{what}: grid shape is {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Value-function snapshot could not be read or written
    #[error("snapshot {path}: {reason}")]
    Snapshot { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigurationFault {
    /// Creates a dimension mismatch fault.
    pub fn dimension(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }
}

/// A request that was rejected without any state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("invalid obstacle number {index}: only {available} service obstacles configured")]
    ObstacleIndexOutOfRange { index: usize, available: usize },

    #[error("obstacle {index} already active")]
    ObstacleAlreadyActive { index: usize },
}

/// An operation was requested before its inputs exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotReady {
    #[error("state not available")]
    StateNotAvailable,

    #[error("certificate not available")]
    CertificateNotAvailable,
}

/// Unknown setup option. Raised at startup only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{value:?} is not a valid {kind}")]
pub struct UnsupportedMode {
    pub kind: &'static str,
    pub value: String,
}

/// Failure of the reachability step operator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("solver produced a non-finite value at cell {cell}")]
    NonFinite { cell: usize },

    #[error(transparent)]
    Configuration(#[from] ConfigurationFault),
}

/// Failure of the minimal-deviation correction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CorrectionError {
    #[error("non-finite correction problem data")]
    NonFinite,

    #[error(transparent)]
    Configuration(#[from] ConfigurationFault),
}

/// Umbrella error for the supervisor API.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("configuration fault: {0}")]
    Configuration(#[from] ConfigurationFault),

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("not ready: {0}")]
    NotReady(#[from] NotReady),

    #[error("unsupported mode: {0}")]
    UnsupportedMode(#[from] UnsupportedMode),

    #[error("solver: {0}")]
    Solver(#[from] SolverError),

    #[error("correction: {0}")]
    Correction(#[from] CorrectionError),

    #[error("environment: {0}")]
    Env(#[from] EnvError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_messages_are_descriptive() {
        let err = RequestError::ObstacleIndexOutOfRange { index: 5, available: 3 };
        assert_eq!(
            err.to_string(),
            "invalid obstacle number 5: only 3 service obstacles configured"
        );
        let err = RequestError::ObstacleAlreadyActive { index: 1 };
        assert_eq!(err.to_string(), "obstacle 1 already active");
    }

    #[test]
    fn test_supervisor_error_conversions() {
        let err: SupervisorError = NotReady::StateNotAvailable.into();
        assert!(matches!(err, SupervisorError::NotReady(NotReady::StateNotAvailable)));

        let err: SupervisorError = UnsupportedMode {
            kind: "vf update method",
            value: "carrier_pigeon".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "unsupported mode: \"carrier_pigeon\" is not a valid vf update method"
        );
    }
}
