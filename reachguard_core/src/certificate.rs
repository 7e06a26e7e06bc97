//! Analytic certifying functions.
//!
//! Used once at cold start: when no richer certificate is available the
//! supervisor tabulates one of these over the grid and lets the refinement
//! loop take it from there.

use crate::geometry::Shape;
use crate::grid::Grid;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Step for the numerical polygon gradient.
const POLYGON_GRADIENT_STEP: f64 = 1e-6;

/// A closed-form safe-set description with value and gradient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CertifyingFunction {
    /// `scalar * (r^2 - |x - c|^2)` over the leading dimensions of `center`
    Circle {
        center: Vec<f64>,
        radius: f64,
        #[serde(default = "default_scalar")]
        scalar: f64,
    },

    /// Interior distance to an axis-aligned box
    Box { lo: Vec<f64>, hi: Vec<f64> },

    /// Interior distance to a polygon in the first two dimensions
    Polygon { vertices: Vec<[f64; 2]> },
}

fn default_scalar() -> f64 {
    1.0
}

impl Default for CertifyingFunction {
    fn default() -> Self {
        CertifyingFunction::Circle {
            center: vec![1.5, 1.5],
            radius: 0.33,
            scalar: 1.0,
        }
    }
}

impl CertifyingFunction {
    /// Value `h(x)`; non-negative inside the certified set.
    pub fn value(&self, state: &[f64]) -> f64 {
        match self {
            CertifyingFunction::Circle {
                center,
                radius,
                scalar,
            } => {
                let dist_sq: f64 = center
                    .iter()
                    .zip(state)
                    .map(|(c, x)| (x - c) * (x - c))
                    .sum();
                scalar * (radius * radius - dist_sq)
            }
            CertifyingFunction::Box { lo, hi } => Shape::Box {
                lo: lo.clone(),
                hi: hi.clone(),
            }
            .interior_distance(state),
            CertifyingFunction::Polygon { vertices } => Shape::Polygon {
                vertices: vertices.clone(),
            }
            .interior_distance(state),
        }
    }

    /// Gradient of `h` with respect to the full state.
    pub fn gradient(&self, state: &[f64]) -> Vec<f64> {
        let mut grad = vec![0.0; state.len()];
        match self {
            CertifyingFunction::Circle { center, scalar, .. } => {
                for (d, c) in center.iter().enumerate().take(state.len()) {
                    grad[d] = -2.0 * scalar * (state[d] - c);
                }
            }
            CertifyingFunction::Box { lo, hi } => {
                // Subgradient of the active face
                let mut best = f64::INFINITY;
                for d in 0..lo.len().min(state.len()) {
                    let (to_lo, to_hi) = (state[d] - lo[d], hi[d] - state[d]);
                    if to_lo < best {
                        best = to_lo;
                        grad.iter_mut().for_each(|g| *g = 0.0);
                        grad[d] = 1.0;
                    }
                    if to_hi < best {
                        best = to_hi;
                        grad.iter_mut().for_each(|g| *g = 0.0);
                        grad[d] = -1.0;
                    }
                }
            }
            CertifyingFunction::Polygon { .. } => {
                let mut shifted = state.to_vec();
                for d in 0..state.len().min(2) {
                    shifted[d] = state[d] + POLYGON_GRADIENT_STEP;
                    let plus = self.value(&shifted);
                    shifted[d] = state[d] - POLYGON_GRADIENT_STEP;
                    let minus = self.value(&shifted);
                    shifted[d] = state[d];
                    grad[d] = (plus - minus) / (2.0 * POLYGON_GRADIENT_STEP);
                }
            }
        }
        grad
    }

    /// Geometry check against the state dimension.
    pub fn validate(&self, state_dim: usize) -> Result<(), crate::error::ConfigurationFault> {
        match self {
            CertifyingFunction::Circle { center, radius, .. } => Shape::Circle {
                center: center.clone(),
                radius: *radius,
            }
            .validate(state_dim),
            CertifyingFunction::Box { lo, hi } => Shape::Box {
                lo: lo.clone(),
                hi: hi.clone(),
            }
            .validate(state_dim),
            CertifyingFunction::Polygon { vertices } => Shape::Polygon {
                vertices: vertices.clone(),
            }
            .validate(state_dim),
        }
    }

    /// Evaluates the function over every grid node.
    pub fn tabulate(&self, grid: &Grid) -> ArrayD<f64> {
        grid.evaluate(|x| self.value(x))
    }
}
