//! ReachGuard Deterministic Simulation Harness
//!
//! This crate runs the full supervisor against a simulated robot under a
//! controlled clock so every scenario is reproducible from one seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: a virtual clock advanced by the runner (and by simulated sleeps)
//! - **Heavy work**: refinement steps run inline instead of on a thread pool
//! - **Randomness**: plant disturbance and estimate noise come from one seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                         │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ current-thread tokio runtime + SimContext clock      │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │ state estimate               ▲ native command       │
//! │  ┌────▼──────────────────────────────┴────┐                 │
//! │  │         Supervisor<SimContext>         │                 │
//! │  └────────────────────────────────────────┘                 │
//! │       ▲                              │                      │
//! │  ┌────┴──────────────────────────────▼────┐                 │
//! │  │  Plant (ground truth, seeded noise)    │                 │
//! │  └────────────────────────────────────────┘                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use reachguard_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::ClosedLoop);
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod plant;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use error::SimError;
pub use plant::{go_to_goal, Plant};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
