//! ReachGuard Core - Reachability-Based Runtime Safety Supervision
//!
//! Keeps a robot inside a numerically certified safe set:
//! 1. **Certificate refinement**: a value function over a state grid is
//!    advanced continuously against the latest hazards and bounds
//! 2. **Hazard aggregation**: obstacles activate once (range, time or request)
//!    and are min-combined with the arena boundary into one distance field
//! 3. **Safety filtering**: nominal controls are minimally corrected so the
//!    certificate stays non-negative
//! 4. **Override arbitration**: per cycle, hold / external / filtered command
//!    selection and translation to the platform's native messages

pub mod arbiter;
pub mod bounds;
pub mod certificate;
pub mod config;
pub mod corrector;
pub mod dynamics;
pub mod error;
pub mod filter;
pub mod geometry;
pub mod grid;
pub mod obstacles;
pub mod platform;
pub mod runtime;
pub mod snapshot;
pub mod solver;
pub mod store;
pub mod supervisor;

// Re-export key types for convenience
pub use arbiter::{ArbiterOutput, ControlSource, OverrideArbiter};
pub use bounds::BoundsSet;
pub use certificate::CertifyingFunction;
pub use config::{SupervisorConfig, UpdateMethod};
pub use error::{ConfigurationFault, NotReady, RequestError, SupervisorError, UnsupportedMode};
pub use filter::{FilterMode, FilterOutcome, FilteredControl, SafetyFilter};
pub use geometry::Shape;
pub use grid::{Grid, GridSpec};
pub use obstacles::{ActivationPolicy, ObstacleAggregator, ObstacleSpec};
pub use platform::{NativeCommand, NativeState, PlatformInterface};
pub use runtime::Supervisor;
pub use store::{CertificateHealth, CertificateStore};
pub use supervisor::{Bootstrap, ReachabilitySupervisor, StepOutcome};
