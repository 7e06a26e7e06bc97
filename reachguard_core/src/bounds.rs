//! Axis-aligned boxes bounding actuation and disturbance.

use crate::error::ConfigurationFault;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Per-dimension `[lo, hi]` box.
///
/// Construction never clamps or reorders; an inconsistent box is stored as
/// given and reported by [`BoundsSet::validate`] wherever it is consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundsSet {
    pub lo: Vec<f64>,
    pub hi: Vec<f64>,
}

impl BoundsSet {
    pub fn new(lo: Vec<f64>, hi: Vec<f64>) -> Self {
        Self { lo, hi }
    }

    /// Symmetric box `[-r, r]` on every axis.
    pub fn symmetric(radius: &[f64]) -> Self {
        Self {
            lo: radius.iter().map(|r| -r).collect(),
            hi: radius.to_vec(),
        }
    }

    pub fn dim(&self) -> usize {
        self.lo.len()
    }

    /// Checks `lo <= hi` (finite) on every axis and the expected dimension.
    pub fn validate(&self, set: &str, expected_dim: usize) -> Result<(), ConfigurationFault> {
        if self.lo.len() != self.hi.len() {
            return Err(ConfigurationFault::dimension(
                format!("{} bounds hi", set),
                self.lo.len(),
                self.hi.len(),
            ));
        }
        if self.lo.len() != expected_dim {
            return Err(ConfigurationFault::dimension(
                format!("{} bounds", set),
                expected_dim,
                self.lo.len(),
            ));
        }
        for (axis, (&lo, &hi)) in self.lo.iter().zip(&self.hi).enumerate() {
            if !(lo.is_finite() && hi.is_finite()) || lo > hi {
                return Err(ConfigurationFault::InconsistentBounds {
                    set: set.to_string(),
                    axis,
                    lo,
                    hi,
                });
            }
        }
        Ok(())
    }

    /// `max_{u in box} c . u`
    pub fn maximize(&self, c: &DVector<f64>) -> f64 {
        c.iter()
            .zip(self.lo.iter().zip(&self.hi))
            .map(|(&ci, (&lo, &hi))| if ci > 0.0 { ci * hi } else { ci * lo })
            .sum()
    }

    /// `min_{d in box} c . d`
    pub fn minimize(&self, c: &DVector<f64>) -> f64 {
        c.iter()
            .zip(self.lo.iter().zip(&self.hi))
            .map(|(&ci, (&lo, &hi))| if ci > 0.0 { ci * lo } else { ci * hi })
            .sum()
    }

    /// Largest magnitude reachable on `axis`.
    pub fn max_abs(&self, axis: usize) -> f64 {
        self.lo[axis].abs().max(self.hi[axis].abs())
    }

    /// Projects `u` onto the box.
    pub fn clamp(&self, u: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            u.len(),
            u.iter()
                .zip(self.lo.iter().zip(&self.hi))
                .map(|(&x, (&lo, &hi))| x.max(lo).min(hi)),
        )
    }

    pub fn contains(&self, u: &DVector<f64>, tolerance: f64) -> bool {
        u.iter()
            .zip(self.lo.iter().zip(&self.hi))
            .all(|(&x, (&lo, &hi))| x >= lo - tolerance && x <= hi + tolerance)
    }
}
