//! The hazard aggregator.
//!
//! Holds the arena boundary plus every configured obstacle. Obstacles start
//! inactive (unless always active) and flip to active exactly once. Each
//! activation triggers a full recomputation of the combined field
//!
//! ```text
//! field(x) = min(boundary.sdf(x), min over active obstacles of obstacle.sdf(x))
//! ```
//!
//! which is handed to a [`FieldSink`].

use crate::error::{ConfigurationFault, RequestError};
use crate::geometry::{euclidean, Shape};
use crate::grid::Grid;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// When an obstacle becomes part of the combined field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ActivationPolicy {
    /// Active from startup
    Always,

    /// Activates once the robot comes within `detection_radius` of the centre
    Range { detection_radius: f64 },

    /// Activates at or after a wall-clock deadline
    Time { deadline_unix_secs: f64 },

    /// Activates on an explicit request by service index
    Manual,
}

/// Static obstacle configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObstacleSpec {
    pub name: String,
    pub geometry: Shape,
    pub activation: ActivationPolicy,
}

/// A configured hazard and its one-way activation latch.
#[derive(Debug)]
pub struct Obstacle {
    spec: ObstacleSpec,
    center: Vec<f64>,
    deadline: Option<SystemTime>,
    active: AtomicBool,
}

impl Obstacle {
    fn new(spec: ObstacleSpec, state_dim: usize) -> Result<Self, ConfigurationFault> {
        spec.geometry.validate(state_dim)?;
        let deadline = match spec.activation {
            ActivationPolicy::Range { detection_radius }
                if !(detection_radius.is_finite() && detection_radius >= 0.0) =>
            {
                return Err(ConfigurationFault::Invalid(format!(
                    "obstacle {:?}: detection radius {}",
                    spec.name, detection_radius
                )));
            }
            ActivationPolicy::Time { deadline_unix_secs } => {
                let offset = Duration::try_from_secs_f64(deadline_unix_secs).map_err(|_| {
                    ConfigurationFault::Invalid(format!(
                        "obstacle {:?}: deadline {}",
                        spec.name, deadline_unix_secs
                    ))
                })?;
                Some(UNIX_EPOCH + offset)
            }
            _ => None,
        };
        let active = matches!(spec.activation, ActivationPolicy::Always);
        Ok(Self {
            center: spec.geometry.center(),
            deadline,
            active: AtomicBool::new(active),
            spec,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn activation(&self) -> &ActivationPolicy {
        &self.spec.activation
    }

    /// Signed distance, negative inside the hazard.
    pub fn sdf(&self, state: &[f64]) -> f64 {
        -self.spec.geometry.interior_distance(state)
    }

    /// Distance from the robot position to the obstacle centre.
    pub fn distance_to(&self, robot_state: &[f64]) -> f64 {
        euclidean(robot_state, &self.center)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Latches the obstacle active. Returns true only for the transition.
    fn activate(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Receives every recomputed combined field.
pub trait FieldSink: Send + Sync {
    fn deliver(&self, field: Arc<ArrayD<f64>>);
}

/// Owner of the boundary, the obstacle set and the combined field.
pub struct ObstacleAggregator {
    grid: Arc<Grid>,
    boundary: Shape,
    obstacles: Vec<Obstacle>,
    /// Indices into `obstacles` of the manually activated ones
    service: Vec<usize>,
    sink: Arc<dyn FieldSink>,
    /// Serializes recompute-and-deliver so fields are delivered in activation order
    recompute: Mutex<()>,
}

impl ObstacleAggregator {
    /// Builds the aggregator. Nothing is delivered until [`publish_current`].
    ///
    /// [`publish_current`]: ObstacleAggregator::publish_current
    pub fn new(
        grid: Arc<Grid>,
        boundary: Shape,
        specs: Vec<ObstacleSpec>,
        sink: Arc<dyn FieldSink>,
    ) -> Result<Self, ConfigurationFault> {
        boundary.validate(grid.ndim())?;
        let obstacles = specs
            .into_iter()
            .map(|spec| Obstacle::new(spec, grid.ndim()))
            .collect::<Result<Vec<_>, _>>()?;
        let service = obstacles
            .iter()
            .enumerate()
            .filter(|(_, o)| matches!(o.activation(), ActivationPolicy::Manual))
            .map(|(i, _)| i)
            .collect();
        Ok(Self {
            grid,
            boundary,
            obstacles,
            service,
            sink,
            recompute: Mutex::new(()),
        })
    }

    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    /// Number of manually activated ("service") obstacles.
    pub fn service_count(&self) -> usize {
        self.service.len()
    }

    /// Names of the currently active obstacles, in configuration order.
    pub fn active_names(&self) -> Vec<String> {
        self.obstacles
            .iter()
            .filter(|o| o.is_active())
            .map(|o| o.name().to_string())
            .collect()
    }

    /// One detection cycle: range and time triggers.
    ///
    /// Returns the number of obstacles that became active. The combined field
    /// is recomputed and delivered when that number is non-zero.
    pub fn update(&self, robot_state: Option<&[f64]>, now: SystemTime) -> usize {
        let mut activated = 0;
        for obstacle in self.obstacles.iter().filter(|o| !o.is_active()) {
            let fire = match (&obstacle.spec.activation, robot_state) {
                (ActivationPolicy::Range { detection_radius }, Some(state)) => {
                    obstacle.distance_to(state) <= *detection_radius
                }
                (ActivationPolicy::Time { .. }, _) => {
                    obstacle.deadline.map_or(false, |deadline| now >= deadline)
                }
                _ => false,
            };
            if fire && obstacle.activate() {
                info!(obstacle = obstacle.name(), trigger = ?obstacle.activation(), "obstacle activated");
                activated += 1;
            }
        }
        if activated > 0 {
            self.publish_current();
        }
        activated
    }

    /// Activates a service obstacle by index.
    pub fn activate_service(&self, index: usize) -> Result<(), RequestError> {
        let &slot = self.service.get(index).ok_or(RequestError::ObstacleIndexOutOfRange {
            index,
            available: self.service.len(),
        })?;
        let obstacle = &self.obstacles[slot];
        if !obstacle.activate() {
            return Err(RequestError::ObstacleAlreadyActive { index });
        }
        info!(obstacle = obstacle.name(), index, "obstacle activated on request");
        self.publish_current();
        Ok(())
    }

    /// Combined field for the current active set.
    pub fn combined_field(&self) -> ArrayD<f64> {
        let active: Vec<&Obstacle> = self.obstacles.iter().filter(|o| o.is_active()).collect();
        self.grid.evaluate(|x| {
            active
                .iter()
                .map(|o| o.sdf(x))
                .fold(self.boundary.interior_distance(x), f64::min)
        })
    }

    /// Recomputes the combined field and delivers it.
    pub fn publish_current(&self) {
        let _guard = self.recompute.lock().unwrap_or_else(PoisonError::into_inner);
        let field = Arc::new(self.combined_field());
        debug!(active = ?self.active_names(), "delivering combined obstacle field");
        self.sink.deliver(field);
    }
}
