//! Scenario runner - drives the supervisor against a simulated plant.

use crate::context::SimContext;
use crate::error::SimError;
use crate::plant::{go_to_goal, Plant};
use crate::scenarios::ScenarioId;

use nalgebra::DVector;
use ndarray::ArrayD;
use reachguard_core::error::SolverError;
use reachguard_core::geometry::euclidean;
use reachguard_core::solver::{LaxFriedrichsSolver, ReachabilitySolver, StepInput};
use reachguard_core::supervisor::RefinementSettings;
use reachguard_core::{
    ActivationPolicy, Bootstrap, BoundsSet, CertificateStore, CertifyingFunction, ControlSource, Grid,
    NativeCommand, ObstacleSpec, ReachabilitySupervisor, RequestError, Shape, StepOutcome, Supervisor,
    SupervisorConfig, SupervisorError,
};
use reachguard_env::{SupervisorContext, Topic};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Committed refinement steps
    pub refinements: u64,

    /// Obstacles activated (any trigger)
    pub activations: u64,

    /// Safety filter cycles run
    pub filter_cycles: u64,

    /// Cycles where the emitted control differed from the nominal
    pub corrections: u64,

    pub hold_cycles: u64,

    pub external_cycles: u64,

    pub filtered_cycles: u64,

    /// Smallest signed distance between the robot and an active obstacle
    pub min_clearance: Option<f64>,
}

impl ScenarioMetrics {
    fn record_source(&mut self, source: ControlSource) {
        match source {
            ControlSource::Hold => self.hold_cycles += 1,
            ControlSource::External => self.external_cycles += 1,
            ControlSource::Filtered => self.filtered_cycles += 1,
            ControlSource::NoCommand => {}
        }
    }

    fn record_clearance(&mut self, clearance: f64) {
        self.min_clearance = Some(self.min_clearance.map_or(clearance, |c| c.min(clearance)));
    }
}

/// Outcome of one scenario body before it is turned into a result.
#[derive(Debug, Default)]
struct Run {
    ticks: u64,
    time_secs: f64,
    metrics: ScenarioMetrics,
    failures: Vec<String>,
}

impl Run {
    fn check(&mut self, condition: bool, failure: impl FnOnce() -> String) {
        if !condition {
            let message = failure();
            warn!("check failed: {}", message);
            self.failures.push(message);
        }
    }
}

/// Runs safety scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Control cycles per simulated second
    tick_rate_hz: u32,

    /// Maximum duration in seconds
    max_duration_secs: f64,

    /// Starting configuration; each scenario overrides what it exercises
    base_config: SupervisorConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tick_rate_hz: 50,
            max_duration_secs: 8.0,
            base_config: SupervisorConfig::default(),
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Replaces the base supervisor configuration.
    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.base_config = config;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let outcome = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(SimError::from)
            .and_then(|runtime| {
                runtime.block_on(async {
                    match scenario {
                        ScenarioId::ObstacleDetection => self.run_obstacle_detection().await,
                        ScenarioId::InvalidActivation => self.run_invalid_activation(),
                        ScenarioId::BoundUpdate => self.run_bound_update().await,
                        ScenarioId::ExternalOverride => self.run_external_override().await,
                        ScenarioId::InconsistentBounds => self.run_inconsistent_bounds().await,
                        ScenarioId::ClosedLoop => self.run_closed_loop().await,
                    }
                })
            });

        match outcome {
            Ok(run) => {
                let passed = run.failures.is_empty();
                ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed,
                    total_ticks: run.ticks,
                    final_time_secs: run.time_secs,
                    failure_reason: (!passed).then(|| run.failures.join("; ")),
                    metrics: run.metrics,
                }
            }
            Err(err) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                total_ticks: 0,
                final_time_secs: 0.0,
                failure_reason: Some(err.to_string()),
                metrics: ScenarioMetrics::default(),
            },
        }
    }

    // ========================================================================
    // SETUP HELPERS
    // ========================================================================

    fn physics_seed(&self) -> u64 {
        self.seed.wrapping_mul(0x9e3779b97f4a7c15)
    }

    fn dt(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate_hz as f64)
    }

    fn target_ticks(&self) -> u64 {
        (self.max_duration_secs * self.tick_rate_hz as f64) as u64
    }

    /// Scenarios drive a robot in the plane through the first two axes.
    fn planar_supervisor(
        &self,
        context: &Arc<SimContext>,
        config: SupervisorConfig,
    ) -> Result<Supervisor<SimContext>, SimError> {
        let supervisor = Supervisor::new(Arc::clone(context), config)?;
        let dynamics = supervisor.dynamics();
        if dynamics.state_dim() != 2 || dynamics.control_dim() != 2 {
            return Err(SimError::Setup(format!(
                "scenario needs planar single-integrator dynamics, configured {}",
                dynamics.name()
            )));
        }
        Ok(supervisor)
    }

    fn plant(&self, supervisor: &Supervisor<SimContext>, start: [f64; 2], estimate_std: f64) -> Result<Plant, SimError> {
        Ok(Plant::new(
            Arc::clone(supervisor.dynamics()),
            DVector::from_vec(start.to_vec()),
            supervisor.config().disturbance_space.clone(),
            self.physics_seed(),
            0.02,
            estimate_std,
        )?)
    }

    // ========================================================================
    // SCENARIOS
    // ========================================================================

    /// RG-001: a range-triggered pillar and a time-triggered gate.
    ///
    /// **Assertion**: each activates exactly once, at the right moment, and
    /// appears with negative distance in the published field.
    async fn run_obstacle_detection(&self) -> Result<Run, SimError> {
        info!("RG-001: ObstacleDetection");
        let context = SimContext::shared(self.seed);
        let epoch_secs = context
            .epoch()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SimError::Setup(e.to_string()))?
            .as_secs_f64();
        let gate_deadline = 1.0;

        let mut config = self.base_config.clone();
        config.obstacles = vec![
            ObstacleSpec {
                name: "pillar".into(),
                geometry: Shape::Circle {
                    center: vec![1.5, 1.5],
                    radius: 0.3,
                },
                activation: ActivationPolicy::Range { detection_radius: 0.5 },
            },
            ObstacleSpec {
                name: "gate".into(),
                geometry: Shape::Box {
                    lo: vec![2.4, 2.4],
                    hi: vec![2.8, 2.8],
                },
                activation: ActivationPolicy::Time {
                    deadline_unix_secs: epoch_secs + gate_deadline,
                },
            },
        ];
        let sup = self.planar_supervisor(&context, config)?;
        let mut plant = self.plant(&sup, [0.5, 1.5], 0.005)?;
        let control = sup.config().control_space.clone();

        let mut run = Run::default();
        let dt = self.dt();
        let mut pillar_distance = None;
        let mut gate_time = None;

        for tick in 0..self.target_ticks() {
            let nominal = go_to_goal(plant.state(), &[1.1, 1.5], 2.0, &control);
            plant.step(&nominal, dt.as_secs_f64());
            context.advance_time(dt);

            let before = sup.aggregator().active_names();
            let activated = sup.on_state_estimate(plant.estimate())?;
            run.metrics.activations += activated as u64;
            if activated > 0 {
                let after = sup.aggregator().active_names();
                if after.iter().any(|n| n == "pillar") && !before.iter().any(|n| n == "pillar") {
                    pillar_distance = Some(euclidean(plant.state().as_slice(), &[1.5, 1.5]));
                }
                if after.iter().any(|n| n == "gate") && !before.iter().any(|n| n == "gate") {
                    gate_time = Some(context.now().as_secs_f64());
                }
            }
            run.ticks = tick + 1;
            if tick % 50 == 0 {
                debug!("  t={:.2}s | x={:.3?} | active={:?}", plant.time(), plant.state().as_slice(), sup.aggregator().active_names());
            }
        }
        run.time_secs = context.now().as_secs_f64();

        let activations = run.metrics.activations;
        run.check(activations == 2, || format!("expected 2 activations, saw {}", activations));
        match pillar_distance {
            Some(d) => run.check(d <= 0.55, || format!("pillar activated at distance {:.3}", d)),
            None => run.check(false, || "pillar never activated".to_string()),
        }
        match gate_time {
            Some(t) => run.check(t >= gate_deadline && t < gate_deadline + 2.0 * dt.as_secs_f64(), || {
                format!("gate activated at t={:.3}s, deadline {:.3}s", t, gate_deadline)
            }),
            None => run.check(false, || "gate never activated".to_string()),
        }

        let field = sup.topics().obstacle_field.latest();
        let grid = sup.store().grid();
        let (pillar, gate) = field
            .map(|f| (grid.interpolate(&f, &[1.5, 1.5]), grid.interpolate(&f, &[2.6, 2.6])))
            .unwrap_or((f64::NAN, f64::NAN));
        run.check(pillar < 0.0, || format!("field at pillar centre is {:.3}", pillar));
        run.check(gate < 0.0, || format!("field at gate centre is {:.3}", gate));

        info!("✓ ObstacleDetection complete: {} activations", run.metrics.activations);
        Ok(run)
    }

    /// RG-002: three service obstacles, a request for index 5, then a valid one.
    fn run_invalid_activation(&self) -> Result<Run, SimError> {
        info!("RG-002: InvalidActivation");
        let context = SimContext::shared(self.seed);
        let mut config = self.base_config.clone();
        config.obstacles = ["door_a", "door_b", "door_c"]
            .iter()
            .enumerate()
            .map(|(i, name)| ObstacleSpec {
                name: name.to_string(),
                geometry: Shape::Box {
                    lo: vec![0.5 + i as f64 * 0.8, 2.0],
                    hi: vec![0.8 + i as f64 * 0.8, 2.4],
                },
                activation: ActivationPolicy::Manual,
            })
            .collect();
        let sup = self.planar_supervisor(&context, config)?;
        let mut run = Run::default();

        let field_revision = sup.store().snapshot().field_revision;
        let rejected = sup.activate_obstacle(5);
        run.check(
            rejected == Err(RequestError::ObstacleIndexOutOfRange { index: 5, available: 3 }),
            || format!("index 5 gave {:?}", rejected),
        );
        run.check(sup.aggregator().active_names().is_empty(), || {
            "rejected request changed the active set".to_string()
        });
        run.check(sup.store().snapshot().field_revision == field_revision, || {
            "rejected request republished the field".to_string()
        });

        sup.activate_obstacle(1)?;
        run.metrics.activations += 1;
        let active = sup.aggregator().active_names();
        run.check(active == vec!["door_b".to_string()], || format!("active set {:?}", active));
        run.check(sup.store().snapshot().field_revision == field_revision + 1, || {
            "valid request did not republish the field".to_string()
        });

        let repeated = sup.activate_obstacle(1);
        run.check(repeated == Err(RequestError::ObstacleAlreadyActive { index: 1 }), || {
            format!("repeated request gave {:?}", repeated)
        });

        info!("✓ InvalidActivation complete");
        Ok(run)
    }

    /// RG-003: actuation bounds change while a refinement step is computing.
    ///
    /// **Assertion**: the running step finishes with the bounds it started
    /// with; the next step uses the new ones.
    async fn run_bound_update(&self) -> Result<Run, SimError> {
        info!("RG-003: BoundUpdate");
        let context = SimContext::shared(self.seed);
        let config = &self.base_config;
        let grid = Arc::new(Grid::new(&config.grid).map_err(SupervisorError::from)?);
        let dynamics = config
            .dynamics_kind()
            .map_err(SupervisorError::from)?
            .build(grid.ndim(), config.gravity);
        let store = Arc::new(CertificateStore::new(
            Arc::clone(&grid),
            config.control_space.clone(),
            config.disturbance_space.clone(),
        ));

        let tightened = BoundsSet::new(
            config.control_space.lo.iter().map(|lo| lo * 0.5).collect(),
            config.control_space.hi.iter().map(|hi| hi * 0.5).collect(),
        );
        let solver = Arc::new(BoundInjector {
            inner: LaxFriedrichsSolver::new(config.solver.cfl),
            store: Arc::clone(&store),
            pending: Mutex::new(Some(tightened.clone())),
            seen: Mutex::new(Vec::new()),
        });
        let refiner = ReachabilitySupervisor::new(
            Arc::clone(&store),
            dynamics,
            solver.clone(),
            RefinementSettings::from_config(config, None),
            Arc::new(Topic::new("/reachability/vf")),
            Arc::new(Topic::new("/reachability/health")),
        );
        refiner
            .bootstrap(Bootstrap::Fallback(config.fallback_certificate.clone()))
            .map_err(SupervisorError::from)?;

        let mut run = Run::default();
        let first = refiner.refine_step(context.as_ref()).await?;
        let second = refiner.refine_step(context.as_ref()).await?;
        run.metrics.refinements = refiner.iterations();
        run.ticks = 2;

        run.check(
            matches!(first, StepOutcome::Committed { bounds_revision: 0, .. }),
            || format!("first step {:?}", first),
        );
        run.check(
            matches!(second, StepOutcome::Committed { bounds_revision: 1, .. }),
            || format!("second step {:?}", second),
        );
        let seen = solver.seen();
        run.check(
            seen == vec![config.control_space.clone(), tightened.clone()],
            || format!("solver saw bounds {:?}", seen),
        );

        info!("✓ BoundUpdate complete: {} refinements", run.metrics.refinements);
        Ok(run)
    }

    /// RG-004: arm, receive one external command, watch it expire.
    ///
    /// **Assertion**: external wins exactly while it is fresh; filtered
    /// control resumes after; disarming yields hold with no command.
    async fn run_external_override(&self) -> Result<Run, SimError> {
        info!("RG-004: ExternalOverride");
        let context = SimContext::shared(self.seed);
        let sup = self.planar_supervisor(&context, self.base_config.clone())?;
        sup.bootstrap()?;
        sup.on_state_estimate(DVector::from_vec(vec![1.5, 1.5]))?;
        sup.refine_now().await?;
        let nominal = DVector::from_vec(vec![0.1, 0.0]);

        let mut run = Run::default();
        sup.on_nominal_control(nominal.clone())?;
        let idle = sup.arbitrate()?;
        run.metrics.record_source(idle.source);
        run.check(idle.source == ControlSource::Hold && idle.command.is_none(), || {
            format!("disarmed cycle gave {:?}", idle.source)
        });

        sup.toggle_armed();
        let external = NativeCommand {
            roll: 0.05,
            thrust: 9.81,
            ..NativeCommand::default()
        };
        let window = sup.arbiter().window();
        let inject_at = Duration::from_millis(500);
        let span = inject_at + window * 2;
        let dt = self.dt();
        let mut sent_at = None;
        let mut mismatches = 0u64;

        while context.now() < span {
            context.advance_time(dt);
            let now = context.now();
            if sent_at.is_none() && now >= inject_at {
                sup.on_external_command(external);
                sent_at = Some(now);
            }
            let filtered = sup.on_nominal_control(nominal.clone())?;
            run.metrics.filter_cycles += 1;
            let decision = sup.arbitrate()?;
            run.metrics.record_source(decision.source);

            let expected = match sent_at {
                Some(at) if now.saturating_sub(at) <= window => ControlSource::External,
                _ => ControlSource::Filtered,
            };
            let command_ok = match decision.source {
                ControlSource::External => decision.command == Some(external),
                ControlSource::Filtered => decision
                    .command
                    .map(|c| (c.roll - filtered.control[0].atan()).abs() < 1e-12)
                    .unwrap_or(false),
                _ => false,
            };
            if decision.source != expected || !command_ok {
                mismatches += 1;
                debug!("  t={:.3}s: got {:?}, expected {:?}", now.as_secs_f64(), decision.source, expected);
            }
            run.ticks += 1;
        }

        run.check(mismatches == 0, || format!("{} arbitration cycles mismatched", mismatches));
        let external_cycles = run.metrics.external_cycles;
        run.check(external_cycles > 0, || "external command never won".to_string());

        sup.toggle_armed();
        let disarmed = sup.arbitrate()?;
        run.metrics.record_source(disarmed.source);
        run.check(disarmed.source == ControlSource::Hold && disarmed.command.is_none(), || {
            format!("after disarm got {:?}", disarmed.source)
        });
        run.time_secs = context.now().as_secs_f64();

        info!(
            "✓ ExternalOverride complete: {} external, {} filtered, {} hold",
            run.metrics.external_cycles, run.metrics.filtered_cycles, run.metrics.hold_cycles
        );
        Ok(run)
    }

    /// RG-005: lo > hi halts the background loop; correcting it resumes.
    async fn run_inconsistent_bounds(&self) -> Result<Run, SimError> {
        info!("RG-005: InconsistentBounds");
        let context = SimContext::shared(self.seed);
        let config = self.base_config.clone();
        let healthy_bounds = config.control_space.clone();
        let sup = self.planar_supervisor(&context, config)?;
        sup.start()?;
        let mut run = Run::default();

        settle(20).await;
        let warm = sup.store().revision();
        run.check(warm > 1, || "refinement loop never committed".to_string());
        run.check(!sup.health().is_stale(), || "certificate stale before fault".to_string());

        sup.on_actuation_update(BoundsSet::new(vec![1.0, -1.0], vec![-1.0, 1.0]));
        settle(2).await;
        let stalled = sup.store().revision();
        settle(20).await;
        run.check(sup.store().revision() == stalled, || {
            format!("certificate advanced under lo > hi ({} -> {})", stalled, sup.store().revision())
        });
        run.check(sup.health().is_stale(), || "certificate not marked stale".to_string());
        run.check(
            sup.topics().health.latest().is_some_and(|h| h.is_stale()),
            || "stale health not published".to_string(),
        );

        sup.on_actuation_update(healthy_bounds);
        settle(20).await;
        run.check(sup.store().revision() > stalled, || "refinement did not resume".to_string());
        run.check(!sup.health().is_stale(), || "certificate still stale after fix".to_string());

        sup.shutdown();
        settle(4).await;
        run.metrics.refinements = sup.iterations();
        run.time_secs = context.now().as_secs_f64();

        info!("✓ InconsistentBounds complete: {} refinements", run.metrics.refinements);
        Ok(run)
    }

    /// RG-006: the nominal controller drives straight through a pillar that
    /// only becomes known on approach.
    ///
    /// **Assertion**: the robot never enters the pillar.
    async fn run_closed_loop(&self) -> Result<Run, SimError> {
        info!("RG-006: ClosedLoop");
        let context = SimContext::shared(self.seed);
        let center = [1.5, 1.5];
        let radius = 0.3;
        let goal = [2.6, 1.5];

        let mut config = self.base_config.clone();
        config.obstacles = vec![ObstacleSpec {
            name: "pillar".into(),
            geometry: Shape::Circle {
                center: center.to_vec(),
                radius,
            },
            activation: ActivationPolicy::Range { detection_radius: 0.5 },
        }];
        config.fallback_certificate = CertifyingFunction::Box {
            lo: vec![0.1, 0.1],
            hi: vec![2.9, 2.9],
        };
        config.disturbance_space = BoundsSet::symmetric(&[0.05, 0.05]);
        config.safety_filter_active = true;

        let sup = self.planar_supervisor(&context, config)?;
        let mut plant = self.plant(&sup, [0.5, 1.5], 0.002)?;
        let control = sup.config().control_space.clone();
        sup.bootstrap()?;
        sup.toggle_armed();

        let mut run = Run::default();
        let dt = self.dt();
        for tick in 0..self.target_ticks() {
            run.metrics.activations += sup.on_state_estimate(plant.estimate())? as u64;
            if let StepOutcome::Committed { .. } = sup.refine_now().await? {
                run.metrics.refinements += 1;
            }

            let nominal = go_to_goal(plant.state(), &goal, 1.5, &control);
            let filtered = sup.on_nominal_control(nominal.clone())?;
            run.metrics.filter_cycles += 1;
            if (&filtered.control - &nominal).norm() > 1e-6 {
                run.metrics.corrections += 1;
            }

            let decision = sup.arbitrate()?;
            run.metrics.record_source(decision.source);
            let applied = match decision.command {
                Some(command) => sup.platform().from_native(&command),
                None => DVector::zeros(control.dim()),
            };
            plant.step(&applied, dt.as_secs_f64());
            context.advance_time(dt);

            if !sup.aggregator().active_names().is_empty() {
                run.metrics
                    .record_clearance(euclidean(plant.state().as_slice(), &center) - radius);
            }
            run.ticks = tick + 1;
            if tick % 50 == 0 {
                debug!(
                    "  t={:.2}s | x={:.3?} | V={:?}",
                    plant.time(),
                    plant.state().as_slice(),
                    filtered.value_at_state
                );
            }
        }
        run.time_secs = context.now().as_secs_f64();

        let activations = run.metrics.activations;
        run.check(activations == 1, || {
            format!("expected the pillar to activate once, saw {}", activations)
        });
        let clearance = run.metrics.min_clearance.unwrap_or(f64::NEG_INFINITY);
        run.check(clearance > -0.05, || format!("robot entered the pillar (clearance {:.3})", clearance));
        let corrections = run.metrics.corrections;
        run.check(corrections > 0, || "filter never corrected the nominal".to_string());
        let (filtered_cycles, ticks) = (run.metrics.filtered_cycles, run.ticks);
        run.check(filtered_cycles == ticks, || {
            format!("{} of {} cycles used the filtered control", filtered_cycles, ticks)
        });

        info!(
            "✓ ClosedLoop complete: clearance {:.3}, {} corrections",
            clearance, run.metrics.corrections
        );
        Ok(run)
    }
}

/// Yields to the other tasks on the simulation runtime.
async fn settle(rounds: usize) {
    for _ in 0..rounds {
        tokio::task::yield_now().await;
    }
}

/// Reference solver that delivers one bound update while its first step is
/// in progress and records the bounds every step was given.
struct BoundInjector {
    inner: LaxFriedrichsSolver,
    store: Arc<CertificateStore>,
    pending: Mutex<Option<BoundsSet>>,
    seen: Mutex<Vec<BoundsSet>>,
}

impl BoundInjector {
    fn seen(&self) -> Vec<BoundsSet> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ReachabilitySolver for BoundInjector {
    fn step(&self, input: &StepInput<'_>) -> Result<ArrayD<f64>, SolverError> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(input.control.clone());
        let update = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(bounds) = update {
            let revision = self.store.set_control_bounds(bounds);
            debug!(revision, "bounds updated mid-step");
        }
        self.inner.step(input)
    }
}
