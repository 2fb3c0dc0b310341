//! The metric source seam.
//!
//! The controller never talks to a metrics backend directly; it goes
//! through the object-safe [`MetricSource`] trait so backends (HTTP,
//! in-memory, cloud APIs) are interchangeable.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use thiserror::Error;

use gantry_state::MetricSample;

/// A transient failure querying the metric source.
///
/// Cloneable so scripted test sources can replay the same failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MetricSourceError {
    #[error("metric query failed: {0}")]
    Query(String),

    #[error("metric query timed out")]
    Timeout,

    #[error("metric response malformed: {0}")]
    Decode(String),
}

/// Boxed future returned by `MetricSource::query`.
pub type QueryFuture<'a> = Pin<Box<dyn Future<Output = Result<MetricSample, MetricSourceError>> + Send + 'a>>;

/// An external source of aggregated metric windows.
///
/// `query` returns the sample count and aggregate value observed for
/// `metric_ref` over `[window_start, window_end]` (epoch seconds). A
/// failed query is transient by definition; the caller decides when a
/// streak of failures becomes fatal.
pub trait MetricSource: Send + Sync {
    fn query<'a>(&'a self, metric_ref: &'a str, window_start: u64, window_end: u64) -> QueryFuture<'a>;
}

/// A metric source that replays a scripted sequence of responses, then a
/// fallback. For testing.
pub struct ScriptedSource {
    responses: Mutex<VecDeque<Result<MetricSample, MetricSourceError>>>,
    fallback: Result<MetricSample, MetricSourceError>,
}

impl ScriptedSource {
    /// Replay `responses` in order, then return `fallback` forever.
    pub fn new(
        responses: Vec<Result<MetricSample, MetricSourceError>>,
        fallback: Result<MetricSample, MetricSourceError>,
    ) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback,
        }
    }

    /// A source that always reports the same sample.
    pub fn always(sample: MetricSample) -> Self {
        Self::new(Vec::new(), Ok(sample))
    }

    /// A source whose every query fails.
    pub fn always_failing(error: MetricSourceError) -> Self {
        Self::new(Vec::new(), Err(error))
    }
}

impl MetricSource for ScriptedSource {
    fn query<'a>(&'a self, _metric_ref: &'a str, _start: u64, _end: u64) -> QueryFuture<'a> {
        let response = self
            .responses
            .lock()
            .expect("scripted source poisoned")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Box::pin(async move { response })
    }
}
