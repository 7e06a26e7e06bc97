//! The reachability supervisor: keeps the certificate current.
//!
//! Each iteration follows prepare / compute / commit:
//!
//! 1. **prepare** takes one store snapshot (values, obstacle field, bounds)
//!    and validates it. The store lock is released before anything heavy runs.
//! 2. **compute** advances the snapshot through the step operator on the
//!    context's blocking executor.
//! 3. **commit** swaps the result in. A field that changed in the meantime is
//!    applied to the result before it becomes visible; a value function that
//!    was replaced in the meantime wins and the result is dropped.
//!
//! Bound updates that land during a step therefore take effect on the next
//! iteration, and the in-flight one commits with the bounds it started with.

use crate::bounds::BoundsSet;
use crate::certificate::CertifyingFunction;
use crate::config::SupervisorConfig;
use crate::dynamics::ControlAffineDynamics;
use crate::error::{ConfigurationFault, SolverError, SupervisorError};
use crate::grid::Grid;
use crate::snapshot::{read_snapshot, write_snapshot};
use crate::solver::{ReachabilitySolver, StepInput};
use crate::store::{CertificateHealth, CertificateStore};
use ndarray::ArrayD;
use reachguard_env::{SupervisorContext, Topic};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// A committed certificate as published outward.
#[derive(Debug, Clone)]
pub struct CertificateUpdate {
    pub values: Arc<ArrayD<f64>>,
    pub revision: u64,
}

/// Where the initial certificate comes from.
#[derive(Debug, Clone)]
pub enum Bootstrap {
    /// Externally supplied array
    Snapshot(ArrayD<f64>),

    /// Snapshot file on disk
    File(PathBuf),

    /// Analytic certifying function tabulated over the grid
    Fallback(CertifyingFunction),
}

/// Loop timing and outputs.
#[derive(Debug, Clone)]
pub struct RefinementSettings {
    /// Backward horizon per iteration (s)
    pub horizon: f64,

    pub loop_delay: Duration,

    pub fault_retry_delay: Duration,

    /// Snapshot written after every commit (file update mode)
    pub snapshot_file: Option<PathBuf>,
}

impl RefinementSettings {
    pub fn from_config(config: &SupervisorConfig, snapshot_file: Option<PathBuf>) -> Self {
        Self {
            horizon: config.solver.time_step,
            loop_delay: config.loop_delay(),
            fault_retry_delay: config.fault_retry_delay(),
            snapshot_file,
        }
    }
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            horizon: 0.1,
            loop_delay: Duration::from_millis(1),
            fault_retry_delay: Duration::from_millis(100),
            snapshot_file: None,
        }
    }
}

/// Result of one refinement iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to refine yet
    Uninitialized,

    Committed { revision: u64, bounds_revision: u64 },

    /// The value function was replaced while the step ran; nothing committed
    Superseded { revision: u64 },
}

/// Inputs copied out of the store for one step.
struct PreparedStep {
    values: Arc<ArrayD<f64>>,
    revision: u64,
    obstacle_field: Arc<ArrayD<f64>>,
    control: BoundsSet,
    disturbance: BoundsSet,
    field_revision: u64,
    bounds_revision: u64,
}

pub struct ReachabilitySupervisor {
    store: Arc<CertificateStore>,
    dynamics: Arc<dyn ControlAffineDynamics>,
    solver: Arc<dyn ReachabilitySolver>,
    settings: RefinementSettings,
    values_out: Arc<Topic<CertificateUpdate>>,
    health_out: Arc<Topic<CertificateHealth>>,
    iterations: AtomicU64,
}

impl ReachabilitySupervisor {
    pub fn new(
        store: Arc<CertificateStore>,
        dynamics: Arc<dyn ControlAffineDynamics>,
        solver: Arc<dyn ReachabilitySolver>,
        settings: RefinementSettings,
        values_out: Arc<Topic<CertificateUpdate>>,
        health_out: Arc<Topic<CertificateHealth>>,
    ) -> Self {
        Self {
            store,
            dynamics,
            solver,
            settings,
            values_out,
            health_out,
            iterations: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    /// Committed refinement steps so far.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Installs the initial certificate and publishes it.
    pub fn bootstrap(&self, source: Bootstrap) -> Result<u64, ConfigurationFault> {
        let grid = self.store.grid();
        let (values, origin) = match source {
            Bootstrap::Snapshot(values) => (values, "snapshot".to_string()),
            Bootstrap::File(path) => (read_snapshot(&path, grid)?, path.display().to_string()),
            Bootstrap::Fallback(function) => {
                function.validate(grid.ndim())?;
                (function.tabulate(grid), format!("{:?}", function))
            }
        };
        let (values, revision) = self.store.replace(values)?;
        info!(%origin, revision, "certificate initialized");
        self.values_out.publish(CertificateUpdate { values, revision });
        Ok(revision)
    }

    fn prepare(&self) -> Result<Option<PreparedStep>, ConfigurationFault> {
        let snapshot = self.store.snapshot();
        let Some(values) = snapshot.values else {
            return Ok(None);
        };
        snapshot
            .control
            .validate("actuation", self.dynamics.control_dim())?;
        snapshot
            .disturbance
            .validate("disturbance", self.dynamics.disturbance_dim())?;
        Ok(Some(PreparedStep {
            values,
            revision: snapshot.revision,
            obstacle_field: snapshot.obstacle_field,
            control: snapshot.control,
            disturbance: snapshot.disturbance,
            field_revision: snapshot.field_revision,
            bounds_revision: snapshot.bounds_revision,
        }))
    }

    fn compute(
        grid: &Grid,
        dynamics: &dyn ControlAffineDynamics,
        solver: &dyn ReachabilitySolver,
        step: &PreparedStep,
        horizon: f64,
    ) -> Result<ArrayD<f64>, SolverError> {
        solver.step(&StepInput {
            grid,
            dynamics,
            values: &step.values,
            obstacle_field: &step.obstacle_field,
            control: &step.control,
            disturbance: &step.disturbance,
            horizon,
        })
    }

    fn commit(&self, step: &PreparedStep, values: ArrayD<f64>) -> Result<StepOutcome, SupervisorError> {
        let Some((values, revision)) =
            self.store
                .commit_refinement(values, step.revision, step.field_revision)?
        else {
            return Ok(StepOutcome::Superseded {
                revision: self.store.revision(),
            });
        };
        self.iterations.fetch_add(1, Ordering::Relaxed);
        if let Some(path) = &self.settings.snapshot_file {
            write_snapshot(path, &values)?;
        }
        self.values_out.publish(CertificateUpdate { values, revision });
        self.publish_health();
        debug!(revision, bounds_revision = step.bounds_revision, "refinement step committed");
        Ok(StepOutcome::Committed {
            revision,
            bounds_revision: step.bounds_revision,
        })
    }

    /// Runs one iteration on the calling thread.
    pub fn refine_once(&self) -> Result<StepOutcome, SupervisorError> {
        let Some(step) = self.prepare()? else {
            return Ok(StepOutcome::Uninitialized);
        };
        let values = Self::compute(
            self.store.grid(),
            self.dynamics.as_ref(),
            self.solver.as_ref(),
            &step,
            self.settings.horizon,
        )?;
        self.commit(&step, values)
    }

    /// Runs one iteration with the heavy step on the context's blocking executor.
    pub async fn refine_step<Ctx: SupervisorContext>(&self, ctx: &Ctx) -> Result<StepOutcome, SupervisorError> {
        let Some(step) = self.prepare()? else {
            return Ok(StepOutcome::Uninitialized);
        };
        let grid = Arc::clone(self.store.grid());
        let dynamics = Arc::clone(&self.dynamics);
        let solver = Arc::clone(&self.solver);
        let horizon = self.settings.horizon;
        let (step, result) = ctx
            .run_blocking(move || {
                let result = Self::compute(&grid, dynamics.as_ref(), solver.as_ref(), &step, horizon);
                (step, result)
            })
            .await?;
        self.commit(&step, result?)
    }

    fn publish_health(&self) {
        let health = self.store.health();
        if self.health_out.latest().as_ref() != Some(&health) {
            self.health_out.publish(health);
        }
    }

    /// Refinement loop. Returns once `stop` turns true or its sender is dropped.
    ///
    /// Faults never escape the loop: they mark the certificate stale and the
    /// iteration is retried after the fault delay.
    pub async fn run<Ctx: SupervisorContext>(self: Arc<Self>, ctx: Arc<Ctx>, mut stop: watch::Receiver<bool>) {
        info!(horizon = self.settings.horizon, "refinement loop started");
        loop {
            if *stop.borrow() {
                break;
            }
            let delay = match self.refine_step(ctx.as_ref()).await {
                Ok(_) => self.settings.loop_delay,
                Err(err) => {
                    error!(%err, "refinement step failed");
                    self.store.mark_stale(err.to_string());
                    self.publish_health();
                    self.settings.fault_retry_delay
                }
            };
            tokio::select! {
                _ = ctx.sleep(delay) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!(iterations = self.iterations(), "refinement loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::SingleIntegrator;
    use crate::grid::GridSpec;
    use crate::solver::LaxFriedrichsSolver;
    use reachguard_env::TokioContext;
    use std::sync::Mutex;

    /// Identity step that records the bounds it was given.
    #[derive(Default)]
    struct RecordingSolver {
        seen: Mutex<Vec<BoundsSet>>,
    }

    impl ReachabilitySolver for RecordingSolver {
        fn step(&self, input: &StepInput<'_>) -> Result<ArrayD<f64>, SolverError> {
            self.seen.lock().unwrap().push(input.control.clone());
            Ok(input.values.clone())
        }
    }

    fn store() -> Arc<CertificateStore> {
        let grid = Arc::new(
            Grid::new(&GridSpec {
                lo: vec![0.0, 0.0],
                hi: vec![3.0, 3.0],
                shape: vec![20, 20],
                periodic_dims: vec![],
            })
            .unwrap(),
        );
        Arc::new(CertificateStore::new(
            grid,
            BoundsSet::symmetric(&[1.0, 1.0]),
            BoundsSet::symmetric(&[0.1, 0.1]),
        ))
    }

    fn supervisor(store: Arc<CertificateStore>, solver: Arc<dyn ReachabilitySolver>) -> Arc<ReachabilitySupervisor> {
        Arc::new(ReachabilitySupervisor::new(
            store,
            Arc::new(SingleIntegrator { dim: 2 }),
            solver,
            RefinementSettings {
                fault_retry_delay: Duration::from_millis(5),
                ..RefinementSettings::default()
            },
            Arc::new(Topic::new("/vf")),
            Arc::new(Topic::new("/vf/health")),
        ))
    }

    #[test]
    fn test_refine_before_bootstrap_is_noop() {
        let sup = supervisor(store(), Arc::new(LaxFriedrichsSolver::default()));
        assert_eq!(sup.refine_once().unwrap(), StepOutcome::Uninitialized);
    }

    #[test]
    fn test_fallback_bootstrap_publishes() {
        let store = store();
        let topic = Arc::new(Topic::new("/vf"));
        let sup = ReachabilitySupervisor::new(
            store.clone(),
            Arc::new(SingleIntegrator { dim: 2 }),
            Arc::new(LaxFriedrichsSolver::default()),
            RefinementSettings::default(),
            topic.clone(),
            Arc::new(Topic::new("/vf/health")),
        );
        let rev = sup
            .bootstrap(Bootstrap::Fallback(CertifyingFunction::default()))
            .unwrap();
        assert_eq!(rev, 1);
        assert!(store.is_initialized());
        assert_eq!(topic.latest().unwrap().revision, 1);
    }

    #[test]
    fn test_bootstrap_rejects_wrong_shape() {
        let store = store();
        let sup = supervisor(store.clone(), Arc::new(LaxFriedrichsSolver::default()));
        let wrong = ArrayD::zeros(ndarray::IxDyn(&[5, 5]));
        assert!(sup.bootstrap(Bootstrap::Snapshot(wrong)).is_err());
        assert!(!store.is_initialized());
    }

    #[test]
    fn test_bound_update_mid_step_applies_next_iteration() {
        let store = store();
        let solver = Arc::new(RecordingSolver::default());
        let sup = supervisor(store.clone(), solver.clone());
        sup.bootstrap(Bootstrap::Fallback(CertifyingFunction::default()))
            .unwrap();

        // Step starts with the configured bounds
        let step = sup.prepare().unwrap().unwrap();
        let new_bounds = BoundsSet::new(vec![-1.0, 0.0], vec![1.0, 1.0]);
        store.set_control_bounds(new_bounds.clone());

        let values = ReachabilitySupervisor::compute(
            store.grid(),
            &SingleIntegrator { dim: 2 },
            solver.as_ref(),
            &step,
            0.1,
        )
        .unwrap();
        let first = sup.commit(&step, values).unwrap();
        assert_eq!(
            first,
            StepOutcome::Committed {
                revision: 2,
                bounds_revision: 0
            }
        );

        let second = sup.refine_once().unwrap();
        assert_eq!(
            second,
            StepOutcome::Committed {
                revision: 3,
                bounds_revision: 1
            }
        );
        let seen = solver.seen.lock().unwrap();
        assert_eq!(seen[0], BoundsSet::symmetric(&[1.0, 1.0]));
        assert_eq!(seen[1], new_bounds);
    }

    #[test]
    fn test_external_replace_mid_step_wins() {
        let store = store();
        let sup = supervisor(store.clone(), Arc::new(LaxFriedrichsSolver::default()));
        sup.bootstrap(Bootstrap::Fallback(CertifyingFunction::default()))
            .unwrap();

        let step = sup.prepare().unwrap().unwrap();
        store.replace(store.grid().filled(-7.0)).unwrap();
        let values = ReachabilitySupervisor::compute(
            store.grid(),
            &SingleIntegrator { dim: 2 },
            &LaxFriedrichsSolver::default(),
            &step,
            0.1,
        )
        .unwrap();

        assert_eq!(sup.commit(&step, values).unwrap(), StepOutcome::Superseded { revision: 2 });
        assert_eq!(sup.iterations(), 0);
        assert!(store.values().unwrap().iter().all(|&v| v == -7.0));

        // The next iteration starts from the external values
        assert_eq!(
            sup.refine_once().unwrap(),
            StepOutcome::Committed {
                revision: 3,
                bounds_revision: 0
            }
        );
    }

    #[test]
    fn test_inconsistent_bounds_do_not_advance() {
        let store = store();
        let sup = supervisor(store.clone(), Arc::new(LaxFriedrichsSolver::default()));
        sup.bootstrap(Bootstrap::Fallback(CertifyingFunction::default()))
            .unwrap();
        store.set_disturbance_bounds(BoundsSet::new(vec![0.2, -0.1], vec![0.1, 0.1]));
        let err = sup.refine_once().unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Configuration(ConfigurationFault::InconsistentBounds { axis: 0, .. })
        ));
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn test_committed_values_respect_obstacle_field() {
        let store = store();
        let sup = supervisor(store.clone(), Arc::new(LaxFriedrichsSolver::default()));
        sup.bootstrap(Bootstrap::Fallback(CertifyingFunction::default()))
            .unwrap();
        let field = store.grid().evaluate(|x| (x[0] - 1.5).abs() - 0.2);
        store.set_obstacle_field(Arc::new(field.clone())).unwrap();
        sup.refine_once().unwrap();
        let values = store.values().unwrap();
        for (v, f) in values.iter().zip(field.iter()) {
            assert!(v <= f);
        }
    }

    #[test]
    fn test_file_mode_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vf.json");
        let store = store();
        let sup = ReachabilitySupervisor::new(
            store.clone(),
            Arc::new(SingleIntegrator { dim: 2 }),
            Arc::new(LaxFriedrichsSolver::default()),
            RefinementSettings {
                snapshot_file: Some(path.clone()),
                ..RefinementSettings::default()
            },
            Arc::new(Topic::new("/vf")),
            Arc::new(Topic::new("/vf/health")),
        );
        sup.bootstrap(Bootstrap::Fallback(CertifyingFunction::default()))
            .unwrap();
        sup.refine_once().unwrap();
        let on_disk = read_snapshot(&path, store.grid()).unwrap();
        assert_eq!(&on_disk, store.values().unwrap().as_ref());

        // And a second supervisor can start from it
        let other = store_from(&path);
        assert!(other.is_initialized());
    }

    fn store_from(path: &std::path::Path) -> Arc<CertificateStore> {
        let store = store();
        let sup = supervisor(store.clone(), Arc::new(LaxFriedrichsSolver::default()));
        sup.bootstrap(Bootstrap::File(path.to_path_buf())).unwrap();
        store
    }

    #[tokio::test]
    async fn test_run_loop_advances_and_stops() {
        let store = store();
        let sup = supervisor(store.clone(), Arc::new(LaxFriedrichsSolver::default()));
        sup.bootstrap(Bootstrap::Fallback(CertifyingFunction::default()))
            .unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(sup.clone().run(TokioContext::shared(), stop_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(sup.iterations() > 0);
        assert!(store.revision() > 1);
        assert_eq!(store.health(), CertificateHealth::Healthy);
    }

    #[tokio::test]
    async fn test_run_loop_goes_stale_and_recovers() {
        let store = store();
        let sup = supervisor(store.clone(), Arc::new(LaxFriedrichsSolver::default()));
        sup.bootstrap(Bootstrap::Fallback(CertifyingFunction::default()))
            .unwrap();
        store.set_control_bounds(BoundsSet::new(vec![1.0, -1.0], vec![-1.0, 1.0]));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(sup.clone().run(TokioContext::shared(), stop_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.health().is_stale());
        assert_eq!(store.revision(), 1);
        assert_eq!(sup.iterations(), 0);

        store.set_control_bounds(BoundsSet::new(vec![-1.0, 0.0], vec![1.0, 1.0]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.health(), CertificateHealth::Healthy);
        assert!(store.revision() > 1);

        drop(stop_tx);
        handle.await.unwrap();
    }
}
