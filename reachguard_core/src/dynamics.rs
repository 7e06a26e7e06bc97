//! Control-affine dynamics models.
//!
//! `x_dot = f(x) + g(x) u + h(x) d`
//!
//! The supervisor only ever sees the [`ControlAffineDynamics`] trait; the
//! concrete models below cover the platforms shipped with the workspace.

use crate::error::UnsupportedMode;
use nalgebra::{DMatrix, DVector};
use std::str::FromStr;
use std::sync::Arc;

/// Standard gravity (m/s^2)
pub const GRAVITY: f64 = 9.81;

/// Drift, control and disturbance terms of a control-affine system.
pub trait ControlAffineDynamics: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn state_dim(&self) -> usize;

    fn control_dim(&self) -> usize;

    fn disturbance_dim(&self) -> usize;

    /// Drift `f(x)`.
    fn open_loop(&self, state: &[f64]) -> DVector<f64>;

    /// Control Jacobian `g(x)` (state_dim x control_dim).
    fn control_matrix(&self, state: &[f64]) -> DMatrix<f64>;

    /// Disturbance Jacobian `h(x)` (state_dim x disturbance_dim).
    fn disturbance_matrix(&self, state: &[f64]) -> DMatrix<f64>;

    /// Full vector field for a given control and disturbance.
    fn vector_field(&self, state: &[f64], control: &DVector<f64>, disturbance: &DVector<f64>) -> DVector<f64> {
        self.open_loop(state)
            + self.control_matrix(state) * control
            + self.disturbance_matrix(state) * disturbance
    }
}

/// `x_dot = u + d` in `dim` dimensions.
#[derive(Debug, Clone)]
pub struct SingleIntegrator {
    pub dim: usize,
}

impl ControlAffineDynamics for SingleIntegrator {
    fn name(&self) -> &'static str {
        "single_integrator"
    }

    fn state_dim(&self) -> usize {
        self.dim
    }

    fn control_dim(&self) -> usize {
        self.dim
    }

    fn disturbance_dim(&self) -> usize {
        self.dim
    }

    fn open_loop(&self, _state: &[f64]) -> DVector<f64> {
        DVector::zeros(self.dim)
    }

    fn control_matrix(&self, _state: &[f64]) -> DMatrix<f64> {
        DMatrix::identity(self.dim, self.dim)
    }

    fn disturbance_matrix(&self, _state: &[f64]) -> DMatrix<f64> {
        DMatrix::identity(self.dim, self.dim)
    }
}

/// Unicycle: state `(x, y, heading)`, control `(v, omega)`, disturbance on
/// the planar position.
#[derive(Debug, Clone, Default)]
pub struct DiffDrive;

impl ControlAffineDynamics for DiffDrive {
    fn name(&self) -> &'static str {
        "diff_drive"
    }

    fn state_dim(&self) -> usize {
        3
    }

    fn control_dim(&self) -> usize {
        2
    }

    fn disturbance_dim(&self) -> usize {
        2
    }

    fn open_loop(&self, _state: &[f64]) -> DVector<f64> {
        DVector::zeros(3)
    }

    fn control_matrix(&self, state: &[f64]) -> DMatrix<f64> {
        let theta = state[2];
        DMatrix::from_row_slice(3, 2, &[theta.cos(), 0.0, theta.sin(), 0.0, 0.0, 1.0])
    }

    fn disturbance_matrix(&self, _state: &[f64]) -> DMatrix<f64> {
        DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0])
    }
}

/// Planar quadrotor in the y-z plane: state `(y, z, y_dot, z_dot)`, control
/// `(tan(roll), thrust)` with thrust as vertical acceleration, additive
/// disturbance on every state.
#[derive(Debug, Clone)]
pub struct PlanarQuadrotor {
    pub gravity: f64,
}

impl Default for PlanarQuadrotor {
    fn default() -> Self {
        Self { gravity: GRAVITY }
    }
}

impl ControlAffineDynamics for PlanarQuadrotor {
    fn name(&self) -> &'static str {
        "planar_quadrotor"
    }

    fn state_dim(&self) -> usize {
        4
    }

    fn control_dim(&self) -> usize {
        2
    }

    fn disturbance_dim(&self) -> usize {
        4
    }

    fn open_loop(&self, state: &[f64]) -> DVector<f64> {
        DVector::from_vec(vec![state[2], state[3], 0.0, -self.gravity])
    }

    fn control_matrix(&self, _state: &[f64]) -> DMatrix<f64> {
        DMatrix::from_row_slice(
            4,
            2,
            &[0.0, 0.0, 0.0, 0.0, self.gravity, 0.0, 0.0, 1.0],
        )
    }

    fn disturbance_matrix(&self, _state: &[f64]) -> DMatrix<f64> {
        DMatrix::identity(4, 4)
    }
}

/// Dynamics model selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicsKind {
    SingleIntegrator,
    DiffDrive,
    PlanarQuadrotor,
}

impl DynamicsKind {
    /// Instantiates the model. `state_dim` sizes the single integrator.
    pub fn build(self, state_dim: usize, gravity: f64) -> Arc<dyn ControlAffineDynamics> {
        match self {
            DynamicsKind::SingleIntegrator => Arc::new(SingleIntegrator { dim: state_dim }),
            DynamicsKind::DiffDrive => Arc::new(DiffDrive),
            DynamicsKind::PlanarQuadrotor => Arc::new(PlanarQuadrotor { gravity }),
        }
    }
}

impl FromStr for DynamicsKind {
    type Err = UnsupportedMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_integrator" => Ok(DynamicsKind::SingleIntegrator),
            "diff_drive" => Ok(DynamicsKind::DiffDrive),
            "planar_quadrotor" | "quad_vertical" => Ok(DynamicsKind::PlanarQuadrotor),
            _ => Err(UnsupportedMode {
                kind: "dynamics model",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_diff_drive_moves_along_heading() {
        let model = DiffDrive;
        let u = DVector::from_vec(vec![1.0, 0.5]);
        let d = DVector::zeros(2);
        let xdot = model.vector_field(&[0.0, 0.0, std::f64::consts::FRAC_PI_2], &u, &d);
        assert_relative_eq!(xdot[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(xdot[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(xdot[2], 0.5);
    }

    #[test]
    fn test_planar_quadrotor_hover() {
        let model = PlanarQuadrotor::default();
        let hover = DVector::from_vec(vec![0.0, GRAVITY]);
        let xdot = model.vector_field(&[0.0, 1.0, 0.0, 0.0], &hover, &DVector::zeros(4));
        assert_relative_eq!(xdot.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_dimensions_agree() {
        let models: Vec<Arc<dyn ControlAffineDynamics>> = vec![
            DynamicsKind::SingleIntegrator.build(2, GRAVITY),
            DynamicsKind::DiffDrive.build(3, GRAVITY),
            DynamicsKind::PlanarQuadrotor.build(4, GRAVITY),
        ];
        for m in models {
            let x = vec![0.1; m.state_dim()];
            assert_eq!(m.open_loop(&x).len(), m.state_dim());
            assert_eq!(m.control_matrix(&x).shape(), (m.state_dim(), m.control_dim()));
            assert_eq!(
                m.disturbance_matrix(&x).shape(),
                (m.state_dim(), m.disturbance_dim())
            );
        }
    }

    #[test]
    fn test_unknown_model_is_unsupported() {
        let err = "hovercraft".parse::<DynamicsKind>().unwrap_err();
        assert_eq!(err.kind, "dynamics model");
    }
}
