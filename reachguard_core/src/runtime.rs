//! Supervisor runtime - wires the components to an execution context.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Supervisor                              │
//! │                                                                  │
//! │  state ──► ObstacleAggregator ──► FieldRoute ──┐                 │
//! │                                                ▼                 │
//! │  bounds ─────────────────────────────► CertificateStore ◄──┐     │
//! │                                                │           │     │
//! │                        ReachabilitySupervisor ◄┘ (loop) ───┘     │
//! │                                                │                 │
//! │  nominal ──► SafetyFilter ◄────── snapshot ────┘                 │
//! │                  │                                               │
//! │                  ▼                                               │
//! │  arm / external ──► OverrideArbiter ──► native command           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use reachguard_core::{Supervisor, SupervisorConfig};
//! use reachguard_env::TokioContext;
//!
//! let supervisor = Supervisor::new(TokioContext::shared(), SupervisorConfig::default())?;
//! supervisor.start()?;
//! supervisor.on_state_estimate(state)?;
//! let filtered = supervisor.on_nominal_control(nominal)?;
//! let decision = supervisor.arbitrate()?;
//! supervisor.shutdown();
//! ```

use crate::arbiter::{ArbiterOutput, OverrideArbiter};
use crate::bounds::BoundsSet;
use crate::config::{SupervisorConfig, UpdateMethod};
use crate::corrector::HalfspaceProjection;
use crate::dynamics::ControlAffineDynamics;
use crate::error::{RequestError, SupervisorError};
use crate::filter::{FilteredControl, SafetyFilter};
use crate::grid::Grid;
use crate::obstacles::{FieldSink, ObstacleAggregator};
use crate::platform::{NativeCommand, NativeDisturbance, NativeState, PlatformInterface};
use crate::snapshot::read_snapshot;
use crate::solver::LaxFriedrichsSolver;
use crate::store::{CertificateHealth, CertificateStore};
use crate::supervisor::{Bootstrap, CertificateUpdate, ReachabilitySupervisor, RefinementSettings, StepOutcome};
use nalgebra::DVector;
use ndarray::ArrayD;
use reachguard_env::{Stamped, SupervisorContext, Topic};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outbound channels.
pub struct SupervisorTopics {
    pub value_function: Arc<Topic<CertificateUpdate>>,

    pub obstacle_field: Arc<Topic<Arc<ArrayD<f64>>>>,

    pub filtered_control: Arc<Topic<Stamped<FilteredControl>>>,

    pub native_command: Arc<Topic<Stamped<NativeCommand>>>,

    /// Disturbance estimates translated for the platform
    pub native_disturbance: Arc<Topic<Stamped<NativeDisturbance>>>,

    /// Which source won each arbitration cycle
    pub arbitration: Arc<Topic<ArbiterOutput>>,

    pub health: Arc<Topic<CertificateHealth>>,
}

impl SupervisorTopics {
    fn new() -> Self {
        Self {
            value_function: Arc::new(Topic::new("/reachability/vf")),
            obstacle_field: Arc::new(Topic::new("/env/obstacle_update")),
            filtered_control: Arc::new(Topic::new("/control/safe")),
            native_command: Arc::new(Topic::new("/control/robot")),
            native_disturbance: Arc::new(Topic::new("/env/disturbance/robot")),
            arbitration: Arc::new(Topic::new("/control/arbitration")),
            health: Arc::new(Topic::new("/reachability/health")),
        }
    }
}

/// Delivers recombined obstacle fields into the store and outward.
struct FieldRoute {
    store: Arc<CertificateStore>,
    topic: Arc<Topic<Arc<ArrayD<f64>>>>,
}

impl FieldSink for FieldRoute {
    fn deliver(&self, field: Arc<ArrayD<f64>>) {
        match self.store.set_obstacle_field(Arc::clone(&field)) {
            Ok(revision) => {
                debug!(revision, "obstacle field updated");
                self.topic.publish(field);
            }
            Err(err) => self.store.mark_stale(err.to_string()),
        }
    }
}

/// A running safety supervisor.
///
/// Generic over the context so the same wiring runs in production (tokio)
/// or in the deterministic simulator.
pub struct Supervisor<Ctx: SupervisorContext> {
    context: Arc<Ctx>,
    config: SupervisorConfig,
    update_method: UpdateMethod,
    store: Arc<CertificateStore>,
    dynamics: Arc<dyn ControlAffineDynamics>,
    aggregator: Arc<ObstacleAggregator>,
    refiner: Arc<ReachabilitySupervisor>,
    filter: Arc<SafetyFilter>,
    arbiter: OverrideArbiter,
    topics: SupervisorTopics,
    stop: watch::Sender<bool>,
}

impl<Ctx: SupervisorContext> Supervisor<Ctx> {
    /// Validates the configuration and builds every component.
    ///
    /// The initial obstacle field (boundary plus always-active obstacles) is
    /// computed here; the certificate is installed by [`start`](Self::start).
    pub fn new(context: Arc<Ctx>, config: SupervisorConfig) -> Result<Self, SupervisorError> {
        config.validate()?;
        let update_method = config.update_method()?;
        let grid = Arc::new(Grid::new(&config.grid)?);
        let dynamics = config.dynamics_kind()?.build(grid.ndim(), config.gravity);
        let platform = config.platform_kind()?.build();

        let store = Arc::new(CertificateStore::new(
            Arc::clone(&grid),
            config.control_space.clone(),
            config.disturbance_space.clone(),
        ));
        let topics = SupervisorTopics::new();

        let route = Arc::new(FieldRoute {
            store: Arc::clone(&store),
            topic: Arc::clone(&topics.obstacle_field),
        });
        let aggregator = Arc::new(ObstacleAggregator::new(
            Arc::clone(&grid),
            config.boundary.clone(),
            config.obstacles.clone(),
            route,
        )?);
        aggregator.publish_current();

        let snapshot_file = match update_method {
            UpdateMethod::File => Some(config.value_snapshot_file.clone()),
            UpdateMethod::PubSub => None,
        };
        let refiner = Arc::new(ReachabilitySupervisor::new(
            Arc::clone(&store),
            Arc::clone(&dynamics),
            Arc::new(LaxFriedrichsSolver::new(config.solver.cfl)),
            RefinementSettings::from_config(&config, snapshot_file),
            Arc::clone(&topics.value_function),
            Arc::clone(&topics.health),
        ));

        let filter = Arc::new(SafetyFilter::new(
            Arc::clone(&store),
            Arc::clone(&dynamics),
            Arc::new(HalfspaceProjection::default()),
            config.filter_mode(),
            config.filter_gamma,
        ));
        let arbiter = OverrideArbiter::new(platform, config.external_window());
        let (stop, _) = watch::channel(false);

        info!(
            grid = ?grid.shape(),
            dynamics = %config.dynamics,
            platform = %config.platform,
            update_method = %config.vf_update_method,
            obstacles = config.obstacles.len(),
            "supervisor configured"
        );

        Ok(Self {
            context,
            config,
            update_method,
            store,
            dynamics,
            aggregator,
            refiner,
            filter,
            arbiter,
            topics,
            stop,
        })
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Installs the initial certificate (if none yet) and spawns the
    /// refinement loop and the periodic obstacle check.
    pub fn start(&self) -> Result<(), SupervisorError> {
        self.bootstrap()?;

        let refiner = Arc::clone(&self.refiner);
        let ctx = Arc::clone(&self.context);
        let stop = self.stop.subscribe();
        self.context
            .spawn("refinement-loop", async move { refiner.run(ctx, stop).await });

        let aggregator = Arc::clone(&self.aggregator);
        let filter = Arc::clone(&self.filter);
        let ctx = Arc::clone(&self.context);
        let mut stop = self.stop.subscribe();
        let period = self.config.obstacle_period();
        self.context.spawn("obstacle-tick", async move {
            loop {
                tokio::select! {
                    _ = ctx.sleep(period) => {
                        let state = filter.state();
                        aggregator.update(state.as_ref().map(|s| s.as_slice()), ctx.system_time());
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        info!("supervisor started");
        Ok(())
    }

    /// Installs the initial certificate unless one is already present.
    pub fn bootstrap(&self) -> Result<(), SupervisorError> {
        if self.store.is_initialized() {
            return Ok(());
        }
        match &self.config.initial_value_file {
            Some(path) => {
                self.refiner.bootstrap(Bootstrap::File(path.clone()))?;
            }
            None => {
                let fallback = self.config.fallback_certificate.clone();
                let revision = self.refiner.bootstrap(Bootstrap::Fallback(fallback.clone()))?;
                self.filter.use_analytic(revision, fallback);
            }
        }
        Ok(())
    }

    /// Signals the background tasks to stop.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        info!("supervisor shutdown requested");
    }

    /// Runs a single refinement iteration in place of the background loop.
    pub async fn refine_now(&self) -> Result<StepOutcome, SupervisorError> {
        self.refiner.refine_step(self.context.as_ref()).await
    }

    // ========================================================================
    // INBOUND EVENTS
    // ========================================================================

    /// Latest state estimate. Also runs the range/time obstacle triggers.
    ///
    /// A state of the wrong dimension is rejected before it can trigger an
    /// activation; the previous estimate stays in place.
    pub fn on_state_estimate(&self, state: DVector<f64>) -> Result<usize, SupervisorError> {
        if let Err(err) = self.store.grid().check_state(state.as_slice(), "state estimate") {
            warn!(%err, "state estimate rejected");
            return Err(err.into());
        }
        let activated = self
            .aggregator
            .update(Some(state.as_slice()), self.context.system_time());
        self.filter.on_state(state);
        Ok(activated)
    }

    /// Native state estimate from the platform.
    pub fn on_native_state(&self, native: &NativeState) -> Result<usize, SupervisorError> {
        let state = self.arbiter.platform().state_from_native(native);
        self.on_state_estimate(state)
    }

    /// Runs the safety filter on a nominal control and publishes the result.
    pub fn on_nominal_control(&self, nominal: DVector<f64>) -> Result<FilteredControl, SupervisorError> {
        match self.filter.filter(nominal, self.context.now()) {
            Ok(filtered) => {
                self.topics
                    .filtered_control
                    .publish(Stamped::new(self.context.now(), filtered.clone()));
                Ok(filtered)
            }
            Err(err) => {
                warn!(%err, "safety filter refused to emit a control");
                Err(err)
            }
        }
    }

    /// Stores new actuation bounds. They reach the filter on its next cycle and
    /// the refinement loop on its next iteration.
    pub fn on_actuation_update(&self, bounds: BoundsSet) -> u64 {
        self.report_bounds("actuation", &bounds, self.dynamics.control_dim());
        self.store.set_control_bounds(bounds)
    }

    /// Translates a disturbance estimate for the platform and publishes it.
    pub fn on_disturbance_estimate(&self, disturbance: &DVector<f64>) -> Result<NativeDisturbance, SupervisorError> {
        let native = self.arbiter.platform().disturbance_to_native(disturbance)?;
        self.topics
            .native_disturbance
            .publish(Stamped::new(self.context.now(), native));
        Ok(native)
    }

    /// Stores new disturbance bounds.
    pub fn on_disturbance_update(&self, bounds: BoundsSet) -> u64 {
        self.report_bounds("disturbance", &bounds, self.dynamics.disturbance_dim());
        self.store.set_disturbance_bounds(bounds)
    }

    fn report_bounds(&self, set: &str, bounds: &BoundsSet, dim: usize) {
        match bounds.validate(set, dim) {
            Ok(()) => info!(set, lo = ?bounds.lo, hi = ?bounds.hi, "bounds updated"),
            Err(err) => warn!(%err, "bounds stored but rejected by consumers until corrected"),
        }
    }

    /// Replaces the combined obstacle field with an externally computed one.
    pub fn on_obstacle_field(&self, field: ArrayD<f64>) -> Result<u64, SupervisorError> {
        let field = Arc::new(field);
        let revision = self.store.set_obstacle_field(Arc::clone(&field))?;
        self.topics.obstacle_field.publish(field);
        Ok(revision)
    }

    /// Replaces the certificate with an externally supplied array.
    pub fn on_value_function(&self, values: ArrayD<f64>) -> Result<u64, SupervisorError> {
        let (values, revision) = self.store.replace(values)?;
        info!(revision, "certificate replaced by external update");
        self.topics
            .value_function
            .publish(CertificateUpdate { values, revision });
        Ok(revision)
    }

    /// Replaces the certificate with the contents of a snapshot file.
    pub fn on_value_function_file(&self, path: &Path) -> Result<u64, SupervisorError> {
        let values = read_snapshot(path, self.store.grid())?;
        self.on_value_function(values)
    }

    /// Activates a manually triggered obstacle.
    pub fn activate_obstacle(&self, index: usize) -> Result<(), RequestError> {
        self.aggregator.activate_service(index).map_err(|err| {
            warn!(%err, "obstacle activation rejected");
            err
        })
    }

    /// Runs the periodic range/time obstacle check.
    pub fn obstacle_tick(&self) -> usize {
        let state = self.filter.state();
        self.aggregator
            .update(state.as_ref().map(|s| s.as_slice()), self.context.system_time())
    }

    /// In-flight toggle (edge-triggered).
    pub fn toggle_armed(&self) -> bool {
        self.arbiter.toggle_armed()
    }

    /// External command notification with payload.
    pub fn on_external_command(&self, command: NativeCommand) {
        self.arbiter.on_external_command(command, self.context.now());
    }

    /// One arbitration cycle over the latest filtered control.
    ///
    /// A failed filter cycle leaves nothing to forward, so an armed platform
    /// gets no command rather than a control computed before the fault.
    pub fn arbitrate(&self) -> Result<ArbiterOutput, SupervisorError> {
        let filtered = self.filter.last_filtered();
        let now = self.context.now();
        let decision = self.arbiter.arbitrate(filtered.as_ref(), now)?;
        if let Some(command) = decision.command {
            self.topics
                .native_command
                .publish(Stamped::new(now, command));
        }
        self.topics.arbitration.publish(decision.clone());
        Ok(decision)
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn context(&self) -> &Arc<Ctx> {
        &self.context
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn update_method(&self) -> UpdateMethod {
        self.update_method
    }

    pub fn topics(&self) -> &SupervisorTopics {
        &self.topics
    }

    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    pub fn aggregator(&self) -> &ObstacleAggregator {
        &self.aggregator
    }

    pub fn filter(&self) -> &SafetyFilter {
        &self.filter
    }

    pub fn arbiter(&self) -> &OverrideArbiter {
        &self.arbiter
    }

    pub fn dynamics(&self) -> &Arc<dyn ControlAffineDynamics> {
        &self.dynamics
    }

    pub fn platform(&self) -> &Arc<dyn PlatformInterface> {
        self.arbiter.platform()
    }

    pub fn health(&self) -> CertificateHealth {
        self.store.health()
    }

    pub fn iterations(&self) -> u64 {
        self.refiner.iterations()
    }
}

impl<Ctx: SupervisorContext> Drop for Supervisor<Ctx> {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}
