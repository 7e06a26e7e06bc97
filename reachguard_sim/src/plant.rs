//! Ground-truth plant for simulation.
//!
//! The plant owns the "true" robot state and integrates the same
//! control-affine model the supervisor reasons about, with a seeded
//! disturbance drawn inside the configured disturbance box:
//! - Forward-Euler kinematics
//! - Gaussian disturbance, clipped to the bounds
//! - Noisy state estimates for the supervisor

use nalgebra::DVector;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, NormalError};
use reachguard_core::dynamics::ControlAffineDynamics;
use reachguard_core::BoundsSet;
use std::sync::Arc;

/// Simulated robot.
pub struct Plant {
    dynamics: Arc<dyn ControlAffineDynamics>,

    /// True state
    state: DVector<f64>,

    /// RNG for disturbance and estimate noise (separate from the scheduler)
    physics_rng: ChaCha8Rng,

    disturbance: BoundsSet,

    disturbance_noise: Normal<f64>,

    estimate_noise: Normal<f64>,

    /// Simulated time (seconds)
    current_time: f64,
}

impl Plant {
    /// Creates a plant at `initial` with the given physics seed.
    ///
    /// `disturbance_std` is the per-axis standard deviation before clipping;
    /// `estimate_std` perturbs the reported state estimate.
    pub fn new(
        dynamics: Arc<dyn ControlAffineDynamics>,
        initial: DVector<f64>,
        disturbance: BoundsSet,
        physics_seed: u64,
        disturbance_std: f64,
        estimate_std: f64,
    ) -> Result<Self, NormalError> {
        Ok(Self {
            dynamics,
            state: initial,
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            disturbance,
            disturbance_noise: Normal::new(0.0, disturbance_std)?,
            estimate_noise: Normal::new(0.0, estimate_std)?,
            current_time: 0.0,
        })
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.state
    }

    pub fn time(&self) -> f64 {
        self.current_time
    }

    /// Advances the plant by `dt` seconds under `control`.
    ///
    /// Returns the disturbance that was applied.
    pub fn step(&mut self, control: &DVector<f64>, dt: f64) -> DVector<f64> {
        let dim = self.dynamics.disturbance_dim();
        let raw = DVector::from_fn(dim, |_, _| self.disturbance_noise.sample(&mut self.physics_rng));
        let disturbance = self.disturbance.clamp(&raw);
        let rate = self
            .dynamics
            .vector_field(self.state.as_slice(), control, &disturbance);
        self.state += rate * dt;
        self.current_time += dt;
        disturbance
    }

    /// Noisy state estimate.
    pub fn estimate(&mut self) -> DVector<f64> {
        let noise = DVector::from_fn(self.state.len(), |_, _| {
            self.estimate_noise.sample(&mut self.physics_rng)
        });
        &self.state + noise
    }
}

/// Saturated proportional go-to-goal controller over the leading position
/// axes. Used as the nominal (unsafe) controller in closed-loop scenarios.
pub fn go_to_goal(state: &DVector<f64>, goal: &[f64], gain: f64, limits: &BoundsSet) -> DVector<f64> {
    let raw = DVector::from_fn(limits.dim(), |i, _| match (goal.get(i), state.get(i)) {
        (Some(g), Some(x)) => gain * (g - x),
        _ => 0.0,
    });
    limits.clamp(&raw)
}
