//! The guarded certificate resource.
//!
//! The value function, the combined obstacle field and both bound sets form a
//! single resource behind one mutex. Readers get a [`CertificateSnapshot`] of
//! `Arc`-shared arrays, so holding a snapshot never blocks a writer and a
//! writer never exposes a half-written array.

use crate::bounds::BoundsSet;
use crate::error::ConfigurationFault;
use crate::grid::Grid;
use ndarray::{ArrayD, Zip};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Whether the certificate is still being advanced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateHealth {
    /// The refinement loop is committing fresh steps
    Healthy,

    /// Refinement is halted; the last committed certificate is stale
    Stale { reason: String },
}

impl CertificateHealth {
    pub fn is_stale(&self) -> bool {
        matches!(self, CertificateHealth::Stale { .. })
    }
}

/// Consistent view of the guarded resource at one instant.
#[derive(Debug, Clone)]
pub struct CertificateSnapshot {
    /// Current value function, `None` until the first certificate arrives
    pub values: Option<Arc<ArrayD<f64>>>,

    /// Latest combined obstacle field
    pub obstacle_field: Arc<ArrayD<f64>>,

    pub control: BoundsSet,

    pub disturbance: BoundsSet,

    /// Bumped on every value-function write
    pub revision: u64,

    /// Bumped on every obstacle-field write
    pub field_revision: u64,

    /// Bumped on every bound-set write
    pub bounds_revision: u64,

    pub health: CertificateHealth,
}

struct StoreInner {
    values: Option<Arc<ArrayD<f64>>>,
    obstacle_field: Arc<ArrayD<f64>>,
    control: BoundsSet,
    disturbance: BoundsSet,
    revision: u64,
    field_revision: u64,
    bounds_revision: u64,
    health: CertificateHealth,
}

/// Single guarded owner of value function, obstacle field and bounds.
pub struct CertificateStore {
    grid: Arc<Grid>,
    inner: Mutex<StoreInner>,
}

impl CertificateStore {
    /// Creates a store with no certificate and an empty (hazard-free) field.
    pub fn new(grid: Arc<Grid>, control: BoundsSet, disturbance: BoundsSet) -> Self {
        let obstacle_field = Arc::new(grid.filled(f64::INFINITY));
        Self {
            grid,
            inner: Mutex::new(StoreInner {
                values: None,
                obstacle_field,
                control,
                disturbance,
                revision: 0,
                field_revision: 0,
                bounds_revision: 0,
                health: CertificateHealth::Healthy,
            }),
        }
    }

    // Every critical section leaves the inner state consistent, so a
    // poisoned lock still guards valid data.
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn grid(&self) -> &Arc<Grid> {
        &self.grid
    }

    /// Copies out the current resource state.
    pub fn snapshot(&self) -> CertificateSnapshot {
        let inner = self.lock();
        CertificateSnapshot {
            values: inner.values.clone(),
            obstacle_field: Arc::clone(&inner.obstacle_field),
            control: inner.control.clone(),
            disturbance: inner.disturbance.clone(),
            revision: inner.revision,
            field_revision: inner.field_revision,
            bounds_revision: inner.bounds_revision,
            health: inner.health.clone(),
        }
    }

    /// Latest committed value function.
    pub fn values(&self) -> Option<Arc<ArrayD<f64>>> {
        self.lock().values.clone()
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// True once any certificate has been stored.
    pub fn is_initialized(&self) -> bool {
        self.lock().values.is_some()
    }

    pub fn health(&self) -> CertificateHealth {
        self.lock().health.clone()
    }

    /// Replaces the value function verbatim (bootstrap or external update).
    ///
    /// Any refinement step already computing from the previous values will
    /// be discarded at commit.
    pub fn replace(&self, values: ArrayD<f64>) -> Result<(Arc<ArrayD<f64>>, u64), ConfigurationFault> {
        self.grid.check_shape(&values, "value function")?;
        let values = Arc::new(values);
        let mut inner = self.lock();
        inner.values = Some(Arc::clone(&values));
        inner.revision += 1;
        Ok((values, inner.revision))
    }

    /// Commits a refinement step computed from value revision `revision`
    /// against obstacle field `field_revision`.
    ///
    /// Returns `None` without writing when the value function was replaced
    /// while the step was running; the step read values that no longer
    /// exist. If only the obstacle field changed, the result is min-combined
    /// with the current field before it becomes visible, so a committed
    /// certificate never marks occupied states as safe.
    pub fn commit_refinement(
        &self,
        mut values: ArrayD<f64>,
        revision: u64,
        field_revision: u64,
    ) -> Result<Option<(Arc<ArrayD<f64>>, u64)>, ConfigurationFault> {
        self.grid.check_shape(&values, "refined value function")?;
        let mut inner = self.lock();
        if inner.revision != revision {
            debug!(
                computed_from = revision,
                current = inner.revision,
                "refinement step superseded by a newer value function"
            );
            return Ok(None);
        }
        if inner.field_revision != field_revision {
            Zip::from(&mut values)
                .and(&*inner.obstacle_field)
                .for_each(|v, &field| *v = v.min(field));
        }
        let values = Arc::new(values);
        inner.values = Some(Arc::clone(&values));
        inner.revision += 1;
        if inner.health.is_stale() {
            info!(previous = ?inner.health, "certificate refinement recovered");
            inner.health = CertificateHealth::Healthy;
        }
        Ok(Some((values, inner.revision)))
    }

    /// Replaces the combined obstacle field.
    pub fn set_obstacle_field(&self, field: Arc<ArrayD<f64>>) -> Result<u64, ConfigurationFault> {
        self.grid.check_shape(&field, "obstacle field")?;
        let mut inner = self.lock();
        inner.obstacle_field = field;
        inner.field_revision += 1;
        Ok(inner.field_revision)
    }

    /// Stores new actuation bounds as given; consistency is checked by consumers.
    pub fn set_control_bounds(&self, bounds: BoundsSet) -> u64 {
        let mut inner = self.lock();
        inner.control = bounds;
        inner.bounds_revision += 1;
        inner.bounds_revision
    }

    /// Stores new disturbance bounds as given; consistency is checked by consumers.
    pub fn set_disturbance_bounds(&self, bounds: BoundsSet) -> u64 {
        let mut inner = self.lock();
        inner.disturbance = bounds;
        inner.bounds_revision += 1;
        inner.bounds_revision
    }

    /// Flags the certificate as stale. Logged once per distinct reason.
    pub fn mark_stale(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.lock();
        let already = matches!(&inner.health, CertificateHealth::Stale { reason: r } if *r == reason);
        if !already {
            warn!(%reason, "certificate is stale");
            inner.health = CertificateHealth::Stale { reason };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridSpec;

    fn store() -> CertificateStore {
        let grid = Arc::new(Grid::new(&GridSpec::default()).unwrap());
        CertificateStore::new(
            grid,
            BoundsSet::symmetric(&[1.0, 1.0]),
            BoundsSet::symmetric(&[0.1, 0.1]),
        )
    }

    #[test]
    fn test_starts_uninitialized() {
        let store = store();
        let snap = store.snapshot();
        assert!(snap.values.is_none());
        assert_eq!(snap.revision, 0);
        assert!(snap.obstacle_field.iter().all(|v| v.is_infinite()));
        assert!(!store.is_initialized());
    }

    #[test]
    fn test_replace_rejects_wrong_shape() {
        let store = store();
        let wrong = ArrayD::zeros(ndarray::IxDyn(&[10, 10]));
        assert!(store.replace(wrong).is_err());
        assert_eq!(store.revision(), 0);

        let ok = store.grid().filled(1.0);
        store.replace(ok).unwrap();
        assert_eq!(store.revision(), 1);
        assert!(store.is_initialized());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let store = store();
        store.replace(store.grid().filled(1.0)).unwrap();
        let before = store.snapshot();
        store.replace(store.grid().filled(2.0)).unwrap();

        let old = before.values.unwrap();
        assert!(old.iter().all(|&v| v == 1.0));
        assert!(store.values().unwrap().iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_commit_reclamps_against_newer_field() {
        let store = store();
        store.replace(store.grid().filled(1.0)).unwrap();
        let snap = store.snapshot();

        // Field changes while the step is in flight
        store
            .set_obstacle_field(Arc::new(store.grid().filled(-0.5)))
            .unwrap();

        let (committed, revision) = store
            .commit_refinement(store.grid().filled(1.0), snap.revision, snap.field_revision)
            .unwrap()
            .unwrap();
        assert!(committed.iter().all(|&v| v == -0.5));
        assert_eq!(revision, 2);
    }

    #[test]
    fn test_commit_keeps_values_when_field_unchanged() {
        let store = store();
        store
            .set_obstacle_field(Arc::new(store.grid().filled(-0.5)))
            .unwrap();
        let snap = store.snapshot();
        let (committed, _) = store
            .commit_refinement(store.grid().filled(0.25), snap.revision, snap.field_revision)
            .unwrap()
            .unwrap();
        assert!(committed.iter().all(|&v| v == 0.25));
    }

    #[test]
    fn test_commit_discarded_after_external_replace() {
        let store = store();
        store.replace(store.grid().filled(1.0)).unwrap();
        let snap = store.snapshot();

        // External update lands while the step is in flight
        let (_, replaced) = store.replace(store.grid().filled(-7.0)).unwrap();
        assert_eq!(replaced, 2);

        let outcome = store
            .commit_refinement(store.grid().filled(0.5), snap.revision, snap.field_revision)
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(store.revision(), 2);
        assert!(store.values().unwrap().iter().all(|&v| v == -7.0));
    }

    #[test]
    fn test_stale_flag_clears_on_commit() {
        let store = store();
        store.mark_stale("inconsistent actuation bounds");
        assert!(store.health().is_stale());

        let snap = store.snapshot();
        store
            .commit_refinement(store.grid().filled(0.0), snap.revision, snap.field_revision)
            .unwrap();
        assert_eq!(store.health(), CertificateHealth::Healthy);
    }

    #[test]
    fn test_bounds_are_stored_unclamped() {
        let store = store();
        let bad = BoundsSet::new(vec![1.0, 0.0], vec![-1.0, 1.0]);
        let rev = store.set_control_bounds(bad.clone());
        assert_eq!(rev, 1);
        assert_eq!(store.snapshot().control, bad);
    }
}
