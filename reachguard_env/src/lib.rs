//! ReachGuard Environment Abstraction Layer
//!
//! This crate provides the abstraction allowing the ReachGuard supervisor
//! to run in both **Production** (tokio) and **Simulation** (virtual clock)
//! environments.
//!
//! # Core Concept
//!
//! The supervisor never touches the clock, the scheduler or the thread pool
//! directly. Everything goes through a [`SupervisorContext`]:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Concurrency (`spawn()`, `run_blocking()`)
//!
//! Outbound data leaves through [`Topic`]s, latest-value channels with a
//! queue depth of one.
//!
//! # Example
//!
//! ```ignore
//! use reachguard_env::{SupervisorContext, Topic};
//!
//! async fn refine<Ctx: SupervisorContext>(ctx: &Ctx, out: &Topic<Vec<f64>>) {
//!     loop {
//!         let values = ctx.run_blocking(|| heavy_step()).await?;
//!         out.publish(values);
//!         ctx.sleep(Duration::from_millis(1)).await;
//!     }
//! }
//! ```

mod context;
mod error;
mod tokio_impl;
mod topic;
mod types;

pub use context::SupervisorContext;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use topic::{Subscription, Topic};
pub use types::Stamped;
