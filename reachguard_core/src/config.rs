//! Supervisor configuration.
//!
//! Loaded once from JSON and validated fail-fast; every string-valued mode is
//! resolved at startup so unknown options never reach the runtime.

use crate::bounds::BoundsSet;
use crate::certificate::CertifyingFunction;
use crate::dynamics::{DynamicsKind, GRAVITY};
use crate::error::{ConfigurationFault, SupervisorError, UnsupportedMode};
use crate::filter::FilterMode;
use crate::geometry::Shape;
use crate::grid::{Grid, GridSpec};
use crate::obstacles::ObstacleSpec;
use crate::platform::PlatformKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// MODES
// ============================================================================

/// How value-function updates travel between supervisor and filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMethod {
    /// Published on the value-function topic
    PubSub,

    /// Written to and polled from a snapshot file
    File,
}

impl FromStr for UpdateMethod {
    type Err = UnsupportedMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pubsub" => Ok(UpdateMethod::PubSub),
            "file" => Ok(UpdateMethod::File),
            _ => Err(UnsupportedMode {
                kind: "vf update method",
                value: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Refinement step parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Backward horizon advanced per iteration (s)
    pub time_step: f64,

    /// Courant number of the reference solver
    pub cfl: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            time_step: 0.1,
            cfl: 0.75,
        }
    }
}

/// Full supervisor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub grid: GridSpec,

    /// `single_integrator`, `diff_drive` or `planar_quadrotor`
    pub dynamics: String,

    /// Only used by `planar_quadrotor`
    pub gravity: f64,

    pub control_space: BoundsSet,

    pub disturbance_space: BoundsSet,

    /// Arena limits, always part of the obstacle field
    pub boundary: Shape,

    /// Manual obstacles are the service obstacles, indexed in this order
    pub obstacles: Vec<ObstacleSpec>,

    /// Tabulated at cold start when no snapshot is given
    pub fallback_certificate: CertifyingFunction,

    pub initial_value_file: Option<PathBuf>,

    /// `pubsub` or `file`
    pub vf_update_method: String,

    pub value_snapshot_file: PathBuf,

    pub safety_filter_active: bool,

    /// Class-K gain of the certificate constraint
    pub filter_gamma: f64,

    pub solver: SolverConfig,

    /// Pause between refinement iterations (ms)
    pub loop_delay_ms: u64,

    /// Pause before retrying after a fault (ms)
    pub fault_retry_delay_ms: u64,

    pub obstacle_update_rate_hz: f64,

    /// `planar_quadrotor` or `planar_quadrotor_prioritized`
    pub platform: String,

    /// External-command freshness window (s)
    pub external_setpoint_buffer_secs: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grid: GridSpec::default(),
            dynamics: "single_integrator".to_string(),
            gravity: GRAVITY,
            control_space: BoundsSet::symmetric(&[1.0, 1.0]),
            disturbance_space: BoundsSet::symmetric(&[0.1, 0.1]),
            boundary: Shape::Box {
                lo: vec![0.0, 0.0],
                hi: vec![3.0, 3.0],
            },
            obstacles: Vec::new(),
            fallback_certificate: CertifyingFunction::default(),
            initial_value_file: None,
            vf_update_method: "pubsub".to_string(),
            value_snapshot_file: PathBuf::from("vf.json"),
            safety_filter_active: true,
            filter_gamma: 1.0,
            solver: SolverConfig::default(),
            loop_delay_ms: 1,
            fault_retry_delay_ms: 100,
            obstacle_update_rate_hz: 10.0,
            platform: "planar_quadrotor".to_string(),
            external_setpoint_buffer_secs: 1.0,
        }
    }
}

impl SupervisorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationFault> {
        serde_json::from_str(json).map_err(|e| ConfigurationFault::Invalid(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigurationFault> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationFault::Invalid(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn update_method(&self) -> Result<UpdateMethod, UnsupportedMode> {
        self.vf_update_method.parse()
    }

    pub fn dynamics_kind(&self) -> Result<DynamicsKind, UnsupportedMode> {
        self.dynamics.parse()
    }

    pub fn platform_kind(&self) -> Result<PlatformKind, UnsupportedMode> {
        self.platform.parse()
    }

    pub fn filter_mode(&self) -> FilterMode {
        if self.safety_filter_active {
            FilterMode::Active
        } else {
            FilterMode::PassThrough
        }
    }

    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms)
    }

    pub fn fault_retry_delay(&self) -> Duration {
        Duration::from_millis(self.fault_retry_delay_ms)
    }

    pub fn obstacle_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.obstacle_update_rate_hz)
    }

    pub fn external_window(&self) -> Duration {
        Duration::from_secs_f64(self.external_setpoint_buffer_secs)
    }

    /// Fail-fast startup check of every mode, dimension and rate.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        self.update_method()?;
        self.platform_kind()?;
        let grid = Grid::new(&self.grid)?;
        let dynamics = self.dynamics_kind()?.build(grid.ndim(), self.gravity);
        if dynamics.state_dim() != grid.ndim() {
            return Err(ConfigurationFault::dimension(
                format!("{} state vs grid", dynamics.name()),
                dynamics.state_dim(),
                grid.ndim(),
            )
            .into());
        }
        self.control_space.validate("actuation", dynamics.control_dim())?;
        self.disturbance_space
            .validate("disturbance", dynamics.disturbance_dim())?;
        self.boundary.validate(grid.ndim())?;
        self.fallback_certificate.validate(grid.ndim())?;
        for obstacle in &self.obstacles {
            obstacle.geometry.validate(grid.ndim())?;
        }

        let positive = [
            ("filter_gamma", self.filter_gamma),
            ("solver.time_step", self.solver.time_step),
            ("solver.cfl", self.solver.cfl),
            ("obstacle_update_rate_hz", self.obstacle_update_rate_hz),
            ("external_setpoint_buffer_secs", self.external_setpoint_buffer_secs),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigurationFault::Invalid(format!("{} must be positive, got {}", name, value)).into());
            }
        }
        if self.solver.cfl > 1.0 {
            return Err(ConfigurationFault::Invalid(format!("solver.cfl {} exceeds 1", self.solver.cfl)).into());
        }
        Ok(())
    }
}
