//! The safety filter.
//!
//! Per nominal-control event the filter reads the latest committed
//! certificate, builds the certificate half-space at the current state and
//! asks the corrector for the closest admissible control:
//!
//! ```text
//! grad V . (f + g u + h d) + gamma V >= 0   for every d in the disturbance box
//! ```
//!
//! The filter never blocks on the refinement loop; it works from a store
//! snapshot taken at the start of the cycle, so bound updates take effect on
//! the next cycle. A failed cycle clears the last result: nothing downstream
//! may keep forwarding a control computed before the fault.

use crate::certificate::CertifyingFunction;
use crate::corrector::{ControlCorrector, CorrectionProblem};
use crate::dynamics::ControlAffineDynamics;
use crate::error::{NotReady, SupervisorError};
use crate::store::CertificateStore;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Static filter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Solve the correction problem every cycle
    Active,

    /// Correction disabled; nominal forwarded once initialized
    PassThrough,
}

/// How the emitted control was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOutcome {
    /// No certificate yet; nominal forwarded unfiltered
    Bypassed,

    /// Filter configured off; nominal forwarded
    PassThrough,

    /// Correction solved
    Corrected { constraint_satisfied: bool },
}

/// One filter cycle's result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilteredControl {
    pub control: DVector<f64>,

    pub nominal: DVector<f64>,

    /// Certificate value at the current state (diagnostic)
    pub value_at_state: Option<f64>,

    pub outcome: FilterOutcome,

    /// Certificate revision the cycle read
    pub certificate_revision: u64,

    /// Context time of the cycle
    pub stamp: Duration,
}

#[derive(Debug, Default)]
struct FilterState {
    state: Option<DVector<f64>>,
    nominal: Option<DVector<f64>>,
    filtered: Option<FilteredControl>,
    initialized: bool,
    /// Closed form of the certificate stored at this revision
    analytic: Option<(u64, CertifyingFunction)>,
}

pub struct SafetyFilter {
    store: Arc<CertificateStore>,
    dynamics: Arc<dyn ControlAffineDynamics>,
    corrector: Arc<dyn ControlCorrector>,
    mode: FilterMode,
    gamma: f64,
    state: Mutex<FilterState>,
}

impl SafetyFilter {
    pub fn new(
        store: Arc<CertificateStore>,
        dynamics: Arc<dyn ControlAffineDynamics>,
        corrector: Arc<dyn ControlCorrector>,
        mode: FilterMode,
        gamma: f64,
    ) -> Self {
        Self {
            store,
            dynamics,
            corrector,
            mode,
            gamma,
            state: Mutex::new(FilterState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FilterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Latest state estimate.
    pub fn on_state(&self, state: DVector<f64>) {
        self.lock().state = Some(state);
    }

    pub fn state(&self) -> Option<DVector<f64>> {
        self.lock().state.clone()
    }

    /// True once a certificate has been seen. Never reverts.
    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    /// Result of the last cycle, `None` if it failed.
    pub fn last_filtered(&self) -> Option<FilteredControl> {
        self.lock().filtered.clone()
    }

    pub fn last_nominal(&self) -> Option<DVector<f64>> {
        self.lock().nominal.clone()
    }

    /// Registers the closed form of the certificate installed at `revision`.
    ///
    /// While the store still holds that revision the filter evaluates value
    /// and gradient exactly instead of from the table.
    pub fn use_analytic(&self, revision: u64, function: CertifyingFunction) {
        self.lock().analytic = Some((revision, function));
    }

    /// Runs one filter cycle on a nominal control at context time `now`.
    pub fn filter(&self, nominal: DVector<f64>, now: Duration) -> Result<FilteredControl, SupervisorError> {
        let result = self.cycle(nominal, now);
        self.lock().filtered = result.as_ref().ok().cloned();
        result
    }

    fn cycle(&self, nominal: DVector<f64>, now: Duration) -> Result<FilteredControl, SupervisorError> {
        let (state, analytic) = {
            let mut guard = self.lock();
            guard.nominal = Some(nominal.clone());
            (guard.state.clone(), guard.analytic.clone())
        };
        let state = state.ok_or(NotReady::StateNotAvailable)?;

        let snapshot = self.store.snapshot();
        let values = match snapshot.values {
            Some(values) => values,
            None => {
                debug!("no certificate yet, bypassing safety filter");
                return Ok(FilteredControl {
                    control: nominal.clone(),
                    nominal,
                    value_at_state: None,
                    outcome: FilterOutcome::Bypassed,
                    certificate_revision: snapshot.revision,
                    stamp: now,
                });
            }
        };

        {
            let mut guard = self.lock();
            if !guard.initialized {
                guard.initialized = true;
                info!(revision = snapshot.revision, mode = ?self.mode, "safety filter initialized");
            }
        }

        let grid = self.store.grid();
        grid.check_state(state.as_slice(), "state estimate")?;
        let x = state.as_slice();
        let analytic = analytic
            .filter(|(revision, _)| *revision == snapshot.revision)
            .map(|(_, function)| function);
        let value = match &analytic {
            Some(function) => function.value(x),
            None => grid.interpolate(&values, x),
        };

        let out = match self.mode {
            FilterMode::PassThrough => FilteredControl {
                control: nominal.clone(),
                nominal,
                value_at_state: Some(value),
                outcome: FilterOutcome::PassThrough,
                certificate_revision: snapshot.revision,
                stamp: now,
            },
            FilterMode::Active => {
                snapshot
                    .disturbance
                    .validate("disturbance", self.dynamics.disturbance_dim())?;
                let grad = DVector::from_vec(match &analytic {
                    Some(function) => function.gradient(x),
                    None => grid.gradient(&values, x),
                });
                let normal = self.dynamics.control_matrix(x).transpose() * &grad;
                let disturbance_term = snapshot
                    .disturbance
                    .minimize(&(self.dynamics.disturbance_matrix(x).transpose() * &grad));
                let offset = -(grad.dot(&self.dynamics.open_loop(x)) + disturbance_term + self.gamma * value);
                let correction = self.corrector.correct(&CorrectionProblem {
                    nominal: &nominal,
                    normal,
                    offset,
                    bounds: &snapshot.control,
                })?;
                if !correction.constraint_satisfied {
                    warn!(value, "no admissible control satisfies the certificate");
                }
                debug!(value, iterations = correction.iterations, "safety filter cycle");
                FilteredControl {
                    control: correction.control,
                    nominal,
                    value_at_state: Some(value),
                    outcome: FilterOutcome::Corrected {
                        constraint_satisfied: correction.constraint_satisfied,
                    },
                    certificate_revision: snapshot.revision,
                    stamp: now,
                }
            }
        };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::BoundsSet;
    use crate::error::ConfigurationFault;
    use crate::corrector::HalfspaceProjection;
    use crate::dynamics::SingleIntegrator;
    use crate::grid::{Grid, GridSpec};
    use proptest::prelude::*;

    fn store() -> Arc<CertificateStore> {
        let grid = Arc::new(Grid::new(&GridSpec::default()).unwrap());
        Arc::new(CertificateStore::new(
            grid,
            BoundsSet::symmetric(&[1.0, 1.0]),
            BoundsSet::symmetric(&[0.0, 0.0]),
        ))
    }

    fn filter(store: Arc<CertificateStore>, mode: FilterMode) -> SafetyFilter {
        SafetyFilter::new(
            store,
            Arc::new(SingleIntegrator { dim: 2 }),
            Arc::new(HalfspaceProjection::default()),
            mode,
            1.0,
        )
    }

    /// Safe set `x0 <= 2`.
    fn wall(store: &CertificateStore) {
        let values = store.grid().evaluate(|x| 2.0 - x[0]);
        store.replace(values).unwrap();
    }

    #[test]
    fn test_refuses_without_state() {
        let f = filter(store(), FilterMode::Active);
        let err = f.filter(DVector::from_vec(vec![1.0, 0.0]), Duration::ZERO).unwrap_err();
        assert!(matches!(err, SupervisorError::NotReady(NotReady::StateNotAvailable)));
        assert!(f.last_filtered().is_none());
    }

    #[test]
    fn test_uninitialized_bypasses() {
        let f = filter(store(), FilterMode::Active);
        f.on_state(DVector::from_vec(vec![1.9, 1.0]));
        let nominal = DVector::from_vec(vec![1.0, 0.0]);
        let out = f.filter(nominal.clone(), Duration::ZERO).unwrap();
        assert_eq!(out.control, nominal);
        assert_eq!(out.outcome, FilterOutcome::Bypassed);
        assert_eq!(out.value_at_state, None);
        assert!(!f.is_initialized());
    }

    #[test]
    fn test_active_filter_corrects_toward_wall() {
        let store = store();
        let f = filter(store.clone(), FilterMode::Active);
        wall(&store);
        f.on_state(DVector::from_vec(vec![1.9, 1.5]));
        // V = 0.1, grad = (-1, 0): -u0 + 0.1 >= 0  =>  u0 <= 0.1
        let out = f.filter(DVector::from_vec(vec![1.0, 0.3]), Duration::ZERO).unwrap();
        assert!(f.is_initialized());
        assert_eq!(
            out.outcome,
            FilterOutcome::Corrected {
                constraint_satisfied: true
            }
        );
        approx::assert_relative_eq!(out.control[0], 0.1, epsilon = 1e-6);
        approx::assert_relative_eq!(out.control[1], 0.3, epsilon = 1e-9);
        approx::assert_relative_eq!(out.value_at_state.unwrap(), 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_pass_through_reports_value() {
        let store = store();
        let f = filter(store.clone(), FilterMode::PassThrough);
        wall(&store);
        f.on_state(DVector::from_vec(vec![1.0, 1.0]));
        let nominal = DVector::from_vec(vec![1.0, 0.0]);
        let out = f.filter(nominal.clone(), Duration::ZERO).unwrap();
        assert_eq!(out.control, nominal);
        assert_eq!(out.outcome, FilterOutcome::PassThrough);
        approx::assert_relative_eq!(out.value_at_state.unwrap(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_bound_update_applies_next_cycle() {
        let store = store();
        let f = filter(store.clone(), FilterMode::Active);
        wall(&store);
        f.on_state(DVector::from_vec(vec![1.0, 1.0]));
        let out = f.filter(DVector::from_vec(vec![-0.8, 0.0]), Duration::ZERO).unwrap();
        assert_eq!(out.control[0], -0.8);

        store.set_control_bounds(BoundsSet::new(vec![-0.5, -0.5], vec![0.5, 0.5]));
        let out = f.filter(DVector::from_vec(vec![-0.8, 0.0]), Duration::ZERO).unwrap();
        approx::assert_relative_eq!(out.control[0], -0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_inconsistent_bounds_surface_as_error() {
        let store = store();
        let f = filter(store.clone(), FilterMode::Active);
        wall(&store);
        f.on_state(DVector::from_vec(vec![1.0, 1.0]));
        store.set_control_bounds(BoundsSet::new(vec![1.0, -1.0], vec![-1.0, 1.0]));
        assert!(matches!(
            f.filter(DVector::from_vec(vec![5.0, 0.0]), Duration::ZERO),
            Err(SupervisorError::Correction(_))
        ));
    }

    #[test]
    fn test_failed_cycle_clears_last_result() {
        let store = store();
        let f = filter(store.clone(), FilterMode::Active);
        wall(&store);
        f.on_state(DVector::from_vec(vec![1.0, 1.0]));
        f.filter(DVector::from_vec(vec![0.5, 0.0]), Duration::ZERO).unwrap();
        assert!(f.last_filtered().is_some());

        store.set_control_bounds(BoundsSet::new(vec![1.0, 1.0], vec![-1.0, -1.0]));
        assert!(f.filter(DVector::from_vec(vec![0.5, 0.0]), Duration::from_millis(20)).is_err());
        assert!(f.last_filtered().is_none());

        store.set_control_bounds(BoundsSet::symmetric(&[1.0, 1.0]));
        let out = f.filter(DVector::from_vec(vec![0.5, 0.0]), Duration::from_millis(40)).unwrap();
        assert_eq!(f.last_filtered(), Some(out.clone()));
        assert_eq!(out.stamp, Duration::from_millis(40));
    }

    #[test]
    fn test_inconsistent_disturbance_surfaces_as_error() {
        let store = store();
        let f = filter(store.clone(), FilterMode::Active);
        wall(&store);
        f.on_state(DVector::from_vec(vec![1.0, 1.0]));
        store.set_disturbance_bounds(BoundsSet::new(vec![0.5, 0.5], vec![-0.5, -0.5]));
        assert!(matches!(
            f.filter(DVector::from_vec(vec![1.0, 0.0]), Duration::ZERO),
            Err(SupervisorError::Configuration(ConfigurationFault::InconsistentBounds { axis: 0, .. }))
        ));

        store.set_disturbance_bounds(BoundsSet::symmetric(&[0.1]));
        assert!(matches!(
            f.filter(DVector::from_vec(vec![1.0, 0.0]), Duration::ZERO),
            Err(SupervisorError::Configuration(ConfigurationFault::DimensionMismatch { .. }))
        ));
        assert!(f.last_filtered().is_none());
    }

    #[test]
    fn test_analytic_certificate_until_first_refinement() {
        let store = store();
        let f = filter(store.clone(), FilterMode::Active);
        let h = CertifyingFunction::default();
        let (_, revision) = store.replace(h.tabulate(store.grid())).unwrap();
        f.use_analytic(revision, h.clone());

        let x = [1.61, 1.53];
        f.on_state(DVector::from_vec(x.to_vec()));
        let out = f.filter(DVector::from_vec(vec![0.0, 0.0]), Duration::ZERO).unwrap();
        assert_eq!(out.value_at_state, Some(h.value(&x)));

        // A newer certificate is read from the table again
        let table = store.grid().filled(0.75);
        store.replace(table).unwrap();
        let out = f.filter(DVector::from_vec(vec![0.0, 0.0]), Duration::ZERO).unwrap();
        approx::assert_relative_eq!(out.value_at_state.unwrap(), 0.75, epsilon = 1e-12);
    }

    proptest! {
        #[test]
        fn prop_uninitialized_returns_nominal(nominal in prop::collection::vec(-100.0f64..100.0, 0..6)) {
            let f = filter(store(), FilterMode::Active);
            f.on_state(DVector::from_vec(vec![0.5, 0.5]));
            let nominal = DVector::from_vec(nominal);
            let out = f.filter(nominal.clone(), Duration::ZERO).unwrap();
            prop_assert_eq!(out.control, nominal);
        }
    }
}
