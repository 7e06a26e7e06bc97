//! Hazard geometry.
//!
//! Every shape measures an *interior* distance over the leading position
//! dimensions of a state: positive inside, zero on the edge, negative outside.
//! Obstacles negate it, the arena boundary uses it as is.

use crate::error::ConfigurationFault;
use serde::{Deserialize, Serialize};

/// Geometric primitive over the position dimensions of the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    /// Ball around `center` (any number of leading dimensions)
    Circle { center: Vec<f64>, radius: f64 },

    /// Axis-aligned box
    Box { lo: Vec<f64>, hi: Vec<f64> },

    /// Simple polygon in the first two dimensions
    Polygon { vertices: Vec<[f64; 2]> },
}

impl Shape {
    /// Checks the parameters against a state dimension.
    pub fn validate(&self, state_dim: usize) -> Result<(), ConfigurationFault> {
        let dims = self.position_dims();
        if dims == 0 || dims > state_dim {
            return Err(ConfigurationFault::InvalidGeometry(format!(
                "shape uses {} position dimensions, state has {}",
                dims, state_dim
            )));
        }
        match self {
            Shape::Circle { center, radius } => {
                if !radius.is_finite() || *radius <= 0.0 || center.iter().any(|c| !c.is_finite()) {
                    return Err(ConfigurationFault::InvalidGeometry(format!(
                        "circle radius {} around {:?}",
                        radius, center
                    )));
                }
            }
            Shape::Box { lo, hi } => {
                if lo.len() != hi.len() {
                    return Err(ConfigurationFault::InvalidGeometry(
                        "box lo/hi lengths differ".into(),
                    ));
                }
                if let Some(axis) = (0..lo.len()).find(|&i| !(lo[i] < hi[i])) {
                    return Err(ConfigurationFault::InvalidGeometry(format!(
                        "box axis {} is empty: [{}, {}]",
                        axis, lo[axis], hi[axis]
                    )));
                }
            }
            Shape::Polygon { vertices } => {
                if vertices.len() < 3 {
                    return Err(ConfigurationFault::InvalidGeometry(format!(
                        "polygon needs 3 vertices, got {}",
                        vertices.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of leading state dimensions the shape lives in.
    pub fn position_dims(&self) -> usize {
        match self {
            Shape::Circle { center, .. } => center.len(),
            Shape::Box { lo, .. } => lo.len(),
            Shape::Polygon { .. } => 2,
        }
    }

    /// Signed distance, positive inside.
    pub fn interior_distance(&self, state: &[f64]) -> f64 {
        match self {
            Shape::Circle { center, radius } => radius - euclidean(state, center),
            Shape::Box { lo, hi } => lo
                .iter()
                .zip(hi)
                .zip(state)
                .map(|((l, h), x)| (x - l).min(h - x))
                .fold(f64::INFINITY, f64::min),
            Shape::Polygon { vertices } => {
                let p = [state[0], state[1]];
                let edge = polygon_edge_distance(vertices, p);
                if polygon_contains(vertices, p) {
                    edge
                } else {
                    -edge
                }
            }
        }
    }

    /// Reference point used for detection ranges.
    pub fn center(&self) -> Vec<f64> {
        match self {
            Shape::Circle { center, .. } => center.clone(),
            Shape::Box { lo, hi } => lo.iter().zip(hi).map(|(l, h)| 0.5 * (l + h)).collect(),
            Shape::Polygon { vertices } => {
                let n = vertices.len() as f64;
                let (sx, sy) = vertices
                    .iter()
                    .fold((0.0, 0.0), |(sx, sy), v| (sx + v[0], sy + v[1]));
                vec![sx / n, sy / n]
            }
        }
    }
}

/// Euclidean distance over the dimensions of `reference`.
pub fn euclidean(state: &[f64], reference: &[f64]) -> f64 {
    reference
        .iter()
        .zip(state)
        .map(|(r, x)| (x - r) * (x - r))
        .sum::<f64>()
        .sqrt()
}

fn polygon_contains(vertices: &[[f64; 2]], p: [f64; 2]) -> bool {
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (a, b) = (vertices[i], vertices[j]);
        if (a[1] > p[1]) != (b[1] > p[1]) {
            let x_cross = a[0] + (p[1] - a[1]) * (b[0] - a[0]) / (b[1] - a[1]);
            if p[0] < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn polygon_edge_distance(vertices: &[[f64; 2]], p: [f64; 2]) -> f64 {
    let mut best = f64::INFINITY;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        best = best.min(segment_distance(vertices[j], vertices[i], p));
        j = i;
    }
    best
}

fn segment_distance(a: [f64; 2], b: [f64; 2], p: [f64; 2]) -> f64 {
    let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq > 0.0 {
        (((p[0] - a[0]) * dx + (p[1] - a[1]) * dy) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let (cx, cy) = (a[0] + t * dx, a[1] + t * dy);
    ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square() -> Shape {
        Shape::Polygon {
            vertices: vec![[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0]],
        }
    }

    #[test]
    fn test_circle_distance_sign() {
        let c = Shape::Circle {
            center: vec![1.5, 1.5],
            radius: 0.5,
        };
        assert_relative_eq!(c.interior_distance(&[1.5, 1.5, 0.3]), 0.5);
        assert_relative_eq!(c.interior_distance(&[2.5, 1.5]), -0.5);
    }

    #[test]
    fn test_box_distance_matches_nearest_face() {
        let b = Shape::Box {
            lo: vec![0.0, 0.0],
            hi: vec![3.0, 3.0],
        };
        assert_relative_eq!(b.interior_distance(&[0.2, 1.5]), 0.2);
        assert_relative_eq!(b.interior_distance(&[1.5, 2.9]), 0.1, epsilon = 1e-12);
        assert!(b.interior_distance(&[3.5, 1.5]) < 0.0);
        assert_eq!(b.center(), vec![1.5, 1.5]);
    }

    #[test]
    fn test_polygon_inside_and_outside() {
        let sq = square();
        assert_relative_eq!(sq.interior_distance(&[1.0, 1.0]), 1.0);
        assert_relative_eq!(sq.interior_distance(&[0.5, 1.0]), 0.5);
        assert_relative_eq!(sq.interior_distance(&[3.0, 1.0]), -1.0);
        assert_eq!(sq.center(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_validation() {
        assert!(square().validate(2).is_ok());
        assert!(square().validate(1).is_err());
        assert!(Shape::Circle {
            center: vec![0.0, 0.0],
            radius: -1.0
        }
        .validate(3)
        .is_err());
        assert!(Shape::Box {
            lo: vec![1.0],
            hi: vec![1.0]
        }
        .validate(2)
        .is_err());
    }

    #[test]
    fn test_shape_deserializes_from_tagged_json() {
        let shape: Shape =
            serde_json::from_str(r#"{"type": "circle", "center": [1.0, 2.0], "radius": 0.3}"#)
                .unwrap();
        assert_eq!(
            shape,
            Shape::Circle {
                center: vec![1.0, 2.0],
                radius: 0.3
            }
        );
    }
}
