//! gantry-rollout — the progressive-delivery controller.
//!
//! This crate drives one rollout attempt at a time per route: apply a
//! stage's candidate weight, bake while polling the health evaluator,
//! then advance, roll back on a breach, or promote after the final stage.
//! Each active deployment runs on its own tokio task; the route's CAS
//! revision token is the only cross-task coordination.
//!
//! # Components
//!
//! - **`schedule`** — weight-shift schedule validation
//! - **`controller`** — the deployment state machine and driver tasks
//! - **`resolver`** — weighted traffic resolution for the data plane
//! - **`events`** — typed transition events for notification sinks
//! - **`error`** — the rollout error taxonomy

pub mod controller;
pub mod error;
pub mod events;
pub mod resolver;
pub mod schedule;

pub use controller::{ControllerConfig, DeploymentController, DeploymentStatusView};
pub use error::RolloutError;
pub use events::{DeploymentEvent, EventBus};
