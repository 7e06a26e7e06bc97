//! Safety supervision scenarios for deterministic simulation.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// RG-001: Range-triggered obstacle joins the field
    ObstacleDetection,

    /// RG-002: Manual activation requests, valid and invalid
    InvalidActivation,

    /// RG-003: Actuation bounds change in the middle of a refinement step
    BoundUpdate,

    /// RG-004: External command freshness window and arming
    ExternalOverride,

    /// RG-005: Inconsistent bounds stall refinement, correction recovers
    InconsistentBounds,

    /// RG-006: Closed loop around a pop-up obstacle
    ClosedLoop,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::ObstacleDetection,
            ScenarioId::InvalidActivation,
            ScenarioId::BoundUpdate,
            ScenarioId::ExternalOverride,
            ScenarioId::InconsistentBounds,
            ScenarioId::ClosedLoop,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::ObstacleDetection => "obstacle_detection",
            ScenarioId::InvalidActivation => "invalid_activation",
            ScenarioId::BoundUpdate => "bound_update",
            ScenarioId::ExternalOverride => "external_override",
            ScenarioId::InconsistentBounds => "inconsistent_bounds",
            ScenarioId::ClosedLoop => "closed_loop",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::ObstacleDetection => "Robot enters a detection radius, obstacle appears in the field",
            ScenarioId::InvalidActivation => "Out-of-range activation request leaves the active set untouched",
            ScenarioId::BoundUpdate => "Bounds updated mid-step apply to the next iteration only",
            ScenarioId::ExternalOverride => "External command wins for one buffer window, then filtered control resumes",
            ScenarioId::InconsistentBounds => "lo > hi stalls refinement and marks the certificate stale until fixed",
            ScenarioId::ClosedLoop => "Nominal controller drives at a pop-up obstacle, filter keeps the robot out",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "obstacle_detection" | "rg-001" => Ok(ScenarioId::ObstacleDetection),
            "invalid_activation" | "rg-002" => Ok(ScenarioId::InvalidActivation),
            "bound_update" | "rg-003" => Ok(ScenarioId::BoundUpdate),
            "external_override" | "rg-004" => Ok(ScenarioId::ExternalOverride),
            "inconsistent_bounds" | "rg-005" => Ok(ScenarioId::InconsistentBounds),
            "closed_loop" | "rg-006" => Ok(ScenarioId::ClosedLoop),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
