//! Minimal-deviation control correction.
//!
//! Solves
//!
//! ```text
//! min |u - u_nom|^2   s.t.   normal . u >= offset,   lo <= u <= hi
//! ```
//!
//! The filter builds the half-space from the certificate; the corrector only
//! sees vectors and a box.

use crate::bounds::BoundsSet;
use crate::error::{ConfigurationFault, CorrectionError};
use nalgebra::DVector;

/// Feasibility slack on the half-space and the box.
const TOLERANCE: f64 = 1e-9;

/// One correction request.
#[derive(Debug, Clone)]
pub struct CorrectionProblem<'a> {
    pub nominal: &'a DVector<f64>,

    /// Half-space normal `g(x)^T grad V`
    pub normal: DVector<f64>,

    /// Half-space offset
    pub offset: f64,

    /// Actuation box valid for this cycle
    pub bounds: &'a BoundsSet,
}

/// Result of a correction.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub control: DVector<f64>,

    /// False when no control in the box satisfies the certificate constraint;
    /// `control` is then the best-effort maximizer of the constraint.
    pub constraint_satisfied: bool,

    pub iterations: usize,
}

/// Constrained minimal-deviation solve.
pub trait ControlCorrector: Send + Sync {
    fn correct(&self, problem: &CorrectionProblem<'_>) -> Result<Correction, CorrectionError>;
}

/// Dykstra alternating projection between the half-space and the box.
#[derive(Debug, Clone)]
pub struct HalfspaceProjection {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for HalfspaceProjection {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-10,
        }
    }
}

fn project_halfspace(y: &DVector<f64>, normal: &DVector<f64>, offset: f64, norm_sq: f64) -> DVector<f64> {
    let slack = normal.dot(y) - offset;
    if slack >= 0.0 {
        y.clone()
    } else {
        y - normal * (slack / norm_sq)
    }
}

/// Box point that maximizes `normal . u`, nominal on axes the normal ignores.
fn best_effort(problem: &CorrectionProblem<'_>) -> DVector<f64> {
    let b = problem.bounds;
    DVector::from_iterator(
        problem.nominal.len(),
        problem.normal.iter().enumerate().map(|(i, &n)| {
            if n > 0.0 {
                b.hi[i]
            } else if n < 0.0 {
                b.lo[i]
            } else {
                problem.nominal[i].clamp(b.lo[i], b.hi[i])
            }
        }),
    )
}

impl ControlCorrector for HalfspaceProjection {
    fn correct(&self, problem: &CorrectionProblem<'_>) -> Result<Correction, CorrectionError> {
        let n = problem.nominal.len();
        if problem.normal.len() != n {
            return Err(ConfigurationFault::dimension("constraint normal", n, problem.normal.len()).into());
        }
        problem.bounds.validate("actuation", n)?;
        if !problem.offset.is_finite()
            || problem.nominal.iter().chain(problem.normal.iter()).any(|x| !x.is_finite())
        {
            return Err(CorrectionError::NonFinite);
        }

        let satisfied = |u: &DVector<f64>| problem.normal.dot(u) >= problem.offset - TOLERANCE;

        if problem.bounds.contains(problem.nominal, TOLERANCE) && satisfied(problem.nominal) {
            return Ok(Correction {
                control: problem.nominal.clone(),
                constraint_satisfied: true,
                iterations: 0,
            });
        }

        // Empty intersection: no amount of projecting helps
        if problem.bounds.maximize(&problem.normal) < problem.offset - TOLERANCE {
            return Ok(Correction {
                control: best_effort(problem),
                constraint_satisfied: false,
                iterations: 0,
            });
        }

        let norm_sq = problem.normal.norm_squared();
        if norm_sq <= f64::EPSILON {
            // Constraint is `0 >= offset`, already known feasible
            return Ok(Correction {
                control: problem.bounds.clamp(problem.nominal),
                constraint_satisfied: true,
                iterations: 0,
            });
        }

        let mut x = problem.nominal.clone();
        let mut p = DVector::zeros(n);
        let mut q = DVector::zeros(n);
        let mut iterations = 0;
        while iterations < self.max_iterations {
            iterations += 1;
            let y = problem.bounds.clamp(&(&x + &p));
            p = &x + &p - &y;
            let next = project_halfspace(&(&y + &q), &problem.normal, problem.offset, norm_sq);
            q = &y + &q - &next;
            let moved = (&next - &x).norm();
            x = next;
            if moved < self.tolerance {
                break;
            }
        }

        let control = problem.bounds.clamp(&x);
        Ok(Correction {
            constraint_satisfied: satisfied(&control),
            control,
            iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn problem<'a>(nominal: &'a DVector<f64>, bounds: &'a BoundsSet, normal: [f64; 2], offset: f64) -> CorrectionProblem<'a> {
        CorrectionProblem {
            nominal,
            normal: DVector::from_vec(normal.to_vec()),
            offset,
            bounds,
        }
    }

    #[test]
    fn test_feasible_nominal_is_untouched() {
        let bounds = BoundsSet::symmetric(&[1.0, 1.0]);
        let nominal = DVector::from_vec(vec![0.3, -0.2]);
        let out = HalfspaceProjection::default()
            .correct(&problem(&nominal, &bounds, [1.0, 0.0], -0.5))
            .unwrap();
        assert_eq!(out.control, nominal);
        assert!(out.constraint_satisfied);
        assert_eq!(out.iterations, 0);
    }

    #[test]
    fn test_projects_onto_halfspace() {
        let bounds = BoundsSet::symmetric(&[1.0, 1.0]);
        let nominal = DVector::from_vec(vec![-0.5, 0.2]);
        // u0 >= 0.1
        let out = HalfspaceProjection::default()
            .correct(&problem(&nominal, &bounds, [1.0, 0.0], 0.1))
            .unwrap();
        assert!(out.constraint_satisfied);
        assert_relative_eq!(out.control[0], 0.1, epsilon = 1e-8);
        assert_relative_eq!(out.control[1], 0.2, epsilon = 1e-8);
    }

    #[test]
    fn test_corner_solution_respects_box() {
        let bounds = BoundsSet::symmetric(&[1.0, 1.0]);
        let nominal = DVector::from_vec(vec![-1.0, -1.0]);
        // u0 + u1 >= 1.5 inside the unit box
        let out = HalfspaceProjection::default()
            .correct(&problem(&nominal, &bounds, [1.0, 1.0], 1.5))
            .unwrap();
        assert!(out.constraint_satisfied);
        assert!(bounds.contains(&out.control, 1e-9));
        assert_relative_eq!(out.control[0], 0.75, epsilon = 1e-6);
        assert_relative_eq!(out.control[1], 0.75, epsilon = 1e-6);
    }

    #[test]
    fn test_infeasible_returns_best_effort() {
        let bounds = BoundsSet::symmetric(&[1.0, 1.0]);
        let nominal = DVector::from_vec(vec![0.0, 0.4]);
        let out = HalfspaceProjection::default()
            .correct(&problem(&nominal, &bounds, [-2.0, 0.0], 5.0))
            .unwrap();
        assert!(!out.constraint_satisfied);
        assert_eq!(out.control, DVector::from_vec(vec![-1.0, 0.4]));
    }

    #[test]
    fn test_rejects_bad_input() {
        let bounds = BoundsSet::new(vec![1.0, -1.0], vec![0.0, 1.0]);
        let nominal = DVector::from_vec(vec![0.0, 0.0]);
        assert!(matches!(
            HalfspaceProjection::default().correct(&problem(&nominal, &bounds, [1.0, 0.0], 0.0)),
            Err(CorrectionError::Configuration(ConfigurationFault::InconsistentBounds { .. }))
        ));

        let bounds = BoundsSet::symmetric(&[1.0, 1.0]);
        let nominal = DVector::from_vec(vec![f64::NAN, 0.0]);
        assert_eq!(
            HalfspaceProjection::default().correct(&problem(&nominal, &bounds, [1.0, 0.0], 0.0)),
            Err(CorrectionError::NonFinite)
        );
    }
}
