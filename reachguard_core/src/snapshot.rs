//! On-disk value-function snapshots.
//!
//! A snapshot is a JSON array of numbers, the value function flattened in
//! row-major order. It carries no shape; the reader reshapes it to the grid.

use crate::error::ConfigurationFault;
use crate::grid::Grid;
use ndarray::ArrayD;
use std::fs;
use std::path::Path;

fn fault(path: &Path, reason: impl ToString) -> ConfigurationFault {
    ConfigurationFault::Snapshot {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Writes `values` to `path`. The file is replaced in one rename so a
/// concurrent reader never sees a partial snapshot.
pub fn write_snapshot(path: &Path, values: &ArrayD<f64>) -> Result<(), ConfigurationFault> {
    let flat: Vec<f64> = values.iter().copied().collect();
    if flat.iter().any(|v| !v.is_finite()) {
        return Err(fault(path, "value function contains non-finite entries"));
    }
    let json = serde_json::to_vec(&flat).map_err(|e| fault(path, e))?;
    let staging = path.with_extension("tmp");
    fs::write(&staging, json).map_err(|e| fault(&staging, e))?;
    fs::rename(&staging, path).map_err(|e| fault(path, e))
}

/// Reads a snapshot and reshapes it to `grid`.
pub fn read_snapshot(path: &Path, grid: &Grid) -> Result<ArrayD<f64>, ConfigurationFault> {
    let bytes = fs::read(path).map_err(|e| fault(path, e))?;
    let flat: Vec<f64> = serde_json::from_slice(&bytes).map_err(|e| fault(path, e))?;
    if flat.len() != grid.num_cells() {
        return Err(fault(
            path,
            format!("{} entries, grid has {} cells", flat.len(), grid.num_cells()),
        ));
    }
    if flat.iter().any(|v| !v.is_finite()) {
        return Err(fault(path, "non-finite entry"));
    }
    grid.reshape(flat, "value-function snapshot")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridSpec;

    fn grid() -> Grid {
        Grid::new(&GridSpec {
            lo: vec![0.0, 0.0],
            hi: vec![1.0, 2.0],
            shape: vec![3, 4],
            periodic_dims: vec![],
        })
        .unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vf.json");
        let g = grid();
        let values = g.evaluate(|x| x[0] * 10.0 + x[1]);
        write_snapshot(&path, &values).unwrap();
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(read_snapshot(&path, &g).unwrap(), values);
    }

    #[test]
    fn test_round_trip_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vf.json");
        let g = Grid::new(&GridSpec {
            shape: vec![20, 20],
            ..GridSpec::default()
        })
        .unwrap();
        let values = g.evaluate(|x| ((x[0] - 1.5).powi(2) + (x[1] - 1.5).powi(2)).sqrt() / 3.0 - 0.1);
        write_snapshot(&path, &values).unwrap();
        let back = read_snapshot(&path, &g).unwrap();
        for (a, b) in values.iter().zip(back.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_layout_is_row_major() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vf.json");
        fs::write(&path, "[0,1,2,3,4,5,6,7,8,9,10,11]").unwrap();
        let values = read_snapshot(&path, &grid()).unwrap();
        assert_eq!(values[ndarray::IxDyn(&[1, 0])], 4.0);
        assert_eq!(values[ndarray::IxDyn(&[2, 3])], 11.0);
    }

    #[test]
    fn test_rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vf.json");
        fs::write(&path, "[1.0, 2.0, 3.0]").unwrap();
        let err = read_snapshot(&path, &grid()).unwrap_err();
        assert!(err.to_string().contains("3 entries, grid has 12 cells"));
    }

    #[test]
    fn test_missing_and_garbled_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_snapshot(&dir.path().join("absent.json"), &grid()).is_err());

        let path = dir.path().join("garbled.json");
        fs::write(&path, "{\"not\": \"an array\"}").unwrap();
        assert!(matches!(
            read_snapshot(&path, &grid()),
            Err(ConfigurationFault::Snapshot { .. })
        ));
    }

    #[test]
    fn test_refuses_to_write_non_finite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vf.json");
        let values = grid().filled(f64::INFINITY);
        assert!(write_snapshot(&path, &values).is_err());
        assert!(!path.exists());
    }
}
