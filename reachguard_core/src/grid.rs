//! The state grid shared by the value function, the dynamics evaluation and
//! every signed distance field.
//!
//! Arrays are stored row-major (`ndarray` standard layout), so flat index
//! arithmetic here matches `ArrayD::iter()` order.

use crate::error::ConfigurationFault;
use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Serializable grid description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    /// Lower corner of the state box
    pub lo: Vec<f64>,

    /// Upper corner of the state box
    pub hi: Vec<f64>,

    /// Number of nodes per axis
    pub shape: Vec<usize>,

    /// Axes that wrap around (e.g. heading)
    #[serde(default)]
    pub periodic_dims: Vec<usize>,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            lo: vec![0.0, 0.0],
            hi: vec![3.0, 3.0],
            shape: vec![50, 50],
            periodic_dims: Vec::new(),
        }
    }
}

/// An n-dimensional regular grid. Immutable once built.
///
/// Non-periodic axes place nodes at `lo + i * (hi - lo) / (n - 1)` so both
/// ends are sampled; periodic axes use `(hi - lo) / n` so `hi` aliases `lo`.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    lo: Vec<f64>,
    hi: Vec<f64>,
    shape: Vec<usize>,
    periodic: Vec<bool>,
    spacing: Vec<f64>,
    strides: Vec<usize>,
}

impl Grid {
    /// Builds a grid, rejecting degenerate axes.
    pub fn new(spec: &GridSpec) -> Result<Self, ConfigurationFault> {
        let ndim = spec.shape.len();
        if ndim == 0 {
            return Err(ConfigurationFault::InvalidGrid("grid has no axes".into()));
        }
        if spec.lo.len() != ndim || spec.hi.len() != ndim {
            return Err(ConfigurationFault::InvalidGrid(format!(
                "lo/hi/shape lengths differ: {}/{}/{}",
                spec.lo.len(),
                spec.hi.len(),
                ndim
            )));
        }

        let mut periodic = vec![false; ndim];
        for &d in &spec.periodic_dims {
            if d >= ndim {
                return Err(ConfigurationFault::InvalidGrid(format!(
                    "periodic axis {} out of range for {}-d grid",
                    d, ndim
                )));
            }
            periodic[d] = true;
        }

        let mut spacing = Vec::with_capacity(ndim);
        for d in 0..ndim {
            let (lo, hi, n) = (spec.lo[d], spec.hi[d], spec.shape[d]);
            if !(lo.is_finite() && hi.is_finite()) || lo >= hi {
                return Err(ConfigurationFault::InvalidGrid(format!(
                    "axis {} has empty extent [{}, {}]",
                    d, lo, hi
                )));
            }
            if n < 2 {
                return Err(ConfigurationFault::InvalidGrid(format!(
                    "axis {} needs at least 2 nodes, got {}",
                    d, n
                )));
            }
            let cells = if periodic[d] { n } else { n - 1 };
            spacing.push((hi - lo) / cells as f64);
        }

        let mut strides = vec![1usize; ndim];
        for d in (0..ndim - 1).rev() {
            strides[d] = strides[d + 1] * spec.shape[d + 1];
        }

        Ok(Self {
            lo: spec.lo.clone(),
            hi: spec.hi.clone(),
            shape: spec.shape.clone(),
            periodic,
            spacing,
            strides,
        })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn lo(&self) -> &[f64] {
        &self.lo
    }

    pub fn hi(&self) -> &[f64] {
        &self.hi
    }

    pub fn spacing(&self) -> &[f64] {
        &self.spacing
    }

    pub fn is_periodic(&self, dim: usize) -> bool {
        self.periodic[dim]
    }

    /// Total number of nodes.
    pub fn num_cells(&self) -> usize {
        self.shape.iter().product()
    }

    /// Coordinate of node `i` along `dim`.
    pub fn coordinate(&self, dim: usize, i: usize) -> f64 {
        self.lo[dim] + i as f64 * self.spacing[dim]
    }

    /// State at a multi-index.
    pub fn state_at(&self, index: &[usize]) -> Vec<f64> {
        index
            .iter()
            .enumerate()
            .map(|(d, &i)| self.coordinate(d, i))
            .collect()
    }

    /// Multi-index of a flat (row-major) index.
    pub fn unravel(&self, flat: usize) -> Vec<usize> {
        self.strides
            .iter()
            .zip(&self.shape)
            .map(|(&stride, &n)| (flat / stride) % n)
            .collect()
    }

    /// State at a flat (row-major) index.
    pub fn state_at_flat(&self, flat: usize) -> Vec<f64> {
        self.state_at(&self.unravel(flat))
    }

    /// Flat index of the neighbour one node forward or backward along `dim`.
    ///
    /// Returns `None` past the edge of a non-periodic axis.
    pub fn neighbor(&self, flat: usize, dim: usize, forward: bool) -> Option<usize> {
        let stride = self.strides[dim];
        let n = self.shape[dim];
        let i = (flat / stride) % n;
        match (forward, i) {
            (true, i) if i + 1 < n => Some(flat + stride),
            (true, _) if self.periodic[dim] => Some(flat - (n - 1) * stride),
            (false, 0) if self.periodic[dim] => Some(flat + (n - 1) * stride),
            (false, 0) => None,
            (false, _) => Some(flat - stride),
            _ => None,
        }
    }

    /// Array of the grid shape filled with `value`.
    pub fn filled(&self, value: f64) -> ArrayD<f64> {
        ArrayD::from_elem(IxDyn(&self.shape), value)
    }

    /// Evaluates `f` at every node. Nodes are evaluated in parallel.
    pub fn evaluate<F>(&self, f: F) -> ArrayD<f64>
    where
        F: Fn(&[f64]) -> f64 + Sync + Send,
    {
        let values: Vec<f64> = (0..self.num_cells())
            .into_par_iter()
            .map(|flat| f(&self.state_at_flat(flat)))
            .collect();
        let mut out = self.filled(0.0);
        for (cell, value) in out.iter_mut().zip(values) {
            *cell = value;
        }
        out
    }

    /// Rejects arrays whose shape is not exactly the grid shape.
    pub fn check_shape(&self, values: &ArrayD<f64>, what: &str) -> Result<(), ConfigurationFault> {
        if values.shape() != self.shape.as_slice() {
            return Err(ConfigurationFault::ShapeMismatch {
                what: what.to_string(),
                expected: self.shape.clone(),
                actual: values.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Reshapes a flat row-major array to the grid shape.
    pub fn reshape(&self, flat: Vec<f64>, what: &str) -> Result<ArrayD<f64>, ConfigurationFault> {
        let actual = flat.len();
        ArrayD::from_shape_vec(IxDyn(&self.shape), flat).map_err(|_| {
            ConfigurationFault::ShapeMismatch {
                what: what.to_string(),
                expected: self.shape.clone(),
                actual: vec![actual],
            }
        })
    }

    /// Rejects states of the wrong dimension.
    pub fn check_state(&self, state: &[f64], what: &str) -> Result<(), ConfigurationFault> {
        if state.len() != self.ndim() {
            return Err(ConfigurationFault::dimension(what, self.ndim(), state.len()));
        }
        Ok(())
    }

    /// Multilinear interpolation of `values` at `state`.
    ///
    /// Non-periodic axes clamp to the grid box; periodic axes wrap.
    pub fn interpolate(&self, values: &ArrayD<f64>, state: &[f64]) -> f64 {
        let ndim = self.ndim();
        let mut base = Vec::with_capacity(ndim);
        let mut upper = Vec::with_capacity(ndim);
        let mut frac = Vec::with_capacity(ndim);

        for d in 0..ndim {
            let n = self.shape[d];
            let t = (state[d] - self.lo[d]) / self.spacing[d];
            if self.periodic[d] {
                let t = t.rem_euclid(n as f64);
                let i0 = (t.floor() as usize).min(n - 1);
                base.push(i0);
                upper.push((i0 + 1) % n);
                frac.push(t - i0 as f64);
            } else {
                let t = t.clamp(0.0, (n - 1) as f64);
                let i0 = (t.floor() as usize).min(n - 2);
                base.push(i0);
                upper.push(i0 + 1);
                frac.push(t - i0 as f64);
            }
        }

        let mut total = 0.0;
        let mut corner = vec![0usize; ndim];
        for mask in 0..(1usize << ndim) {
            let mut weight = 1.0;
            for d in 0..ndim {
                if mask & (1 << d) != 0 {
                    corner[d] = upper[d];
                    weight *= frac[d];
                } else {
                    corner[d] = base[d];
                    weight *= 1.0 - frac[d];
                }
            }
            if weight != 0.0 {
                total += weight * values[corner.as_slice()];
            }
        }
        total
    }

    /// Central-difference gradient of the interpolated field at `state`.
    ///
    /// Non-periodic axes fall back to one-sided differences at the edge.
    pub fn gradient(&self, values: &ArrayD<f64>, state: &[f64]) -> Vec<f64> {
        let mut shifted = state.to_vec();
        (0..self.ndim())
            .map(|d| {
                let h = self.spacing[d];
                let (mut plus, mut minus) = (state[d] + h, state[d] - h);
                if !self.periodic[d] {
                    plus = plus.min(self.hi[d]);
                    minus = minus.max(self.lo[d]);
                }
                shifted[d] = plus;
                let v_plus = self.interpolate(values, &shifted);
                shifted[d] = minus;
                let v_minus = self.interpolate(values, &shifted);
                shifted[d] = state[d];
                if plus > minus {
                    (v_plus - v_minus) / (plus - minus)
                } else {
                    0.0
                }
            })
            .collect()
    }
}
