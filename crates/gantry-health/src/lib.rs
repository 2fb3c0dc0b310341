//! gantry-health — health evaluation for progressive rollouts.
//!
//! The deployment controller asks this crate one question during a bake:
//! is the candidate healthy right now? The answer is a [`VerdictRecord`]
//! (`gantry_state::VerdictRecord`) — healthy, breaching, or inconclusive —
//! always paired with the raw sample or query error that produced it.
//!
//! # Components
//!
//! - **`source`** — the `MetricSource` seam to the external metrics backend,
//!   plus a scripted in-memory source for tests
//! - **`evaluator`** — window evaluation against a `HealthPolicy`, and the
//!   consecutive-error budget tracker
//! - **`http_source`** — a `MetricSource` that queries an HTTP endpoint

pub mod evaluator;
pub mod http_source;
pub mod source;

pub use evaluator::{ErrorStreak, HealthEvaluator};
pub use http_source::HttpMetricSource;
pub use source::{MetricSource, MetricSourceError, QueryFuture, ScriptedSource};
