//! Reachability step operator.
//!
//! The supervisor treats the step as a black box behind [`ReachabilitySolver`].
//! [`LaxFriedrichsSolver`] is the reference operator: first-order central
//! differences with Lax-Friedrichs dissipation, advanced backward in time
//! over CFL-limited sub-steps, with the obstacle field applied as a
//! postprocessing clamp after every sub-step.

use crate::bounds::BoundsSet;
use crate::dynamics::ControlAffineDynamics;
use crate::error::{ConfigurationFault, SolverError};
use crate::grid::Grid;
use nalgebra::{DMatrix, DVector};
use ndarray::ArrayD;
use rayon::prelude::*;
use tracing::debug;

/// Inputs of one refinement step, all taken from a single snapshot.
pub struct StepInput<'a> {
    pub grid: &'a Grid,

    pub dynamics: &'a dyn ControlAffineDynamics,

    /// Value function at the start of the step
    pub values: &'a ArrayD<f64>,

    /// Combined obstacle field used as the value clamp
    pub obstacle_field: &'a ArrayD<f64>,

    pub control: &'a BoundsSet,

    pub disturbance: &'a BoundsSet,

    /// Backward time horizon covered by the step (s)
    pub horizon: f64,
}

impl StepInput<'_> {
    /// Checks shapes, dimensions and bound consistency.
    pub fn validate(&self) -> Result<(), ConfigurationFault> {
        self.grid.check_shape(self.values, "value function")?;
        self.grid.check_shape(self.obstacle_field, "obstacle field")?;
        if self.dynamics.state_dim() != self.grid.ndim() {
            return Err(ConfigurationFault::dimension(
                format!("{} state", self.dynamics.name()),
                self.grid.ndim(),
                self.dynamics.state_dim(),
            ));
        }
        self.control.validate("actuation", self.dynamics.control_dim())?;
        self.disturbance
            .validate("disturbance", self.dynamics.disturbance_dim())?;
        if !(self.horizon.is_finite() && self.horizon > 0.0) {
            return Err(ConfigurationFault::Invalid(format!(
                "step horizon {}",
                self.horizon
            )));
        }
        Ok(())
    }
}

/// Advances a value function by one bounded-horizon step.
pub trait ReachabilitySolver: Send + Sync {
    fn step(&self, input: &StepInput<'_>) -> Result<ArrayD<f64>, SolverError>;
}

/// Dynamics terms at one grid node. They do not depend on the value, so they
/// are evaluated once per step.
struct NodeTerms {
    drift: DVector<f64>,
    control: DMatrix<f64>,
    disturbance: DMatrix<f64>,
}

/// Lax-Friedrichs scheme for the avoid-set Hamiltonian
/// `H(x, p) = p.f(x) + max_u p.g(x)u + min_d p.h(x)d`.
#[derive(Debug, Clone)]
pub struct LaxFriedrichsSolver {
    /// Courant number, in (0, 1]
    pub cfl: f64,

    /// Upper bound on sub-steps per call; the covered horizon shrinks when hit
    pub max_substeps: usize,
}

impl Default for LaxFriedrichsSolver {
    fn default() -> Self {
        Self {
            cfl: 0.75,
            max_substeps: 200,
        }
    }
}

impl LaxFriedrichsSolver {
    pub fn new(cfl: f64) -> Self {
        Self {
            cfl,
            ..Self::default()
        }
    }

    /// Per-axis dissipation coefficients: a bound on `|dH/dp_i|` over the grid.
    fn dissipation(terms: &[NodeTerms], control: &BoundsSet, disturbance: &BoundsSet, ndim: usize) -> Vec<f64> {
        terms
            .par_iter()
            .map(|t| {
                (0..ndim)
                    .map(|i| {
                        let u: f64 = (0..t.control.ncols())
                            .map(|j| t.control[(i, j)].abs() * control.max_abs(j))
                            .sum();
                        let d: f64 = (0..t.disturbance.ncols())
                            .map(|j| t.disturbance[(i, j)].abs() * disturbance.max_abs(j))
                            .sum();
                        t.drift[i].abs() + u + d
                    })
                    .collect::<Vec<f64>>()
            })
            .reduce(
                || vec![0.0; ndim],
                |a, b| a.iter().zip(&b).map(|(x, y)| x.max(*y)).collect(),
            )
    }
}

impl ReachabilitySolver for LaxFriedrichsSolver {
    fn step(&self, input: &StepInput<'_>) -> Result<ArrayD<f64>, SolverError> {
        input.validate()?;
        let grid = input.grid;
        let ndim = grid.ndim();
        let cells = grid.num_cells();

        let terms: Vec<NodeTerms> = (0..cells)
            .into_par_iter()
            .map(|flat| {
                let x = grid.state_at_flat(flat);
                NodeTerms {
                    drift: input.dynamics.open_loop(&x),
                    control: input.dynamics.control_matrix(&x),
                    disturbance: input.dynamics.disturbance_matrix(&x),
                }
            })
            .collect();

        let alpha = Self::dissipation(&terms, input.control, input.disturbance, ndim);
        let rate: f64 = alpha.iter().zip(grid.spacing()).map(|(a, h)| a / h).sum();

        let (substeps, dt) = if rate > 0.0 {
            let dt_max = self.cfl / rate;
            let wanted = (input.horizon / dt_max).ceil().max(1.0) as usize;
            let substeps = wanted.min(self.max_substeps.max(1));
            (substeps, (input.horizon / substeps as f64).min(dt_max))
        } else {
            (1, input.horizon)
        };
        debug!(substeps, dt, ?alpha, "lax-friedrichs step");

        let field: Vec<f64> = input.obstacle_field.iter().copied().collect();
        let mut v: Vec<f64> = input
            .values
            .iter()
            .zip(&field)
            .map(|(v, f)| v.min(*f))
            .collect();

        for _ in 0..substeps {
            let current = &v;
            let next: Vec<f64> = (0..cells)
                .into_par_iter()
                .map(|flat| {
                    let here = current[flat];
                    let mut p_mean = DVector::zeros(ndim);
                    let mut dissipation = 0.0;
                    for d in 0..ndim {
                        let h = grid.spacing()[d];
                        let forward = grid.neighbor(flat, d, true).map(|n| (current[n] - here) / h);
                        let backward = grid.neighbor(flat, d, false).map(|n| (here - current[n]) / h);
                        let (p_plus, p_minus) = match (forward, backward) {
                            (Some(f), Some(b)) => (f, b),
                            (Some(f), None) => (f, f),
                            (None, Some(b)) => (b, b),
                            (None, None) => (0.0, 0.0),
                        };
                        p_mean[d] = 0.5 * (p_plus + p_minus);
                        dissipation += alpha[d] * 0.5 * (p_plus - p_minus);
                    }
                    let t = &terms[flat];
                    let hamiltonian = p_mean.dot(&t.drift)
                        + input.control.maximize(&(t.control.transpose() * &p_mean))
                        + input
                            .disturbance
                            .minimize(&(t.disturbance.transpose() * &p_mean));
                    (here + dt * (hamiltonian + dissipation)).min(field[flat])
                })
                .collect();
            v = next;
        }

        if let Some(cell) = v.iter().position(|x| !x.is_finite()) {
            return Err(SolverError::NonFinite { cell });
        }
        Ok(grid.reshape(v, "refined value function")?)
    }
}
