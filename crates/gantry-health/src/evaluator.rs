//! Window evaluation against a health policy.
//!
//! One evaluation queries the metric source over the policy's lookback
//! window and classifies the result. The verdict always carries its
//! evidence (the raw sample, or the query error) so a rollback decision
//! can be reconstructed afterwards.

use std::sync::Arc;

use tracing::{debug, warn};

use gantry_state::{HealthPolicy, MissingDataPolicy, VerdictKind, VerdictRecord};

use crate::source::MetricSource;

/// Evaluates a health policy against a metric source.
pub struct HealthEvaluator {
    source: Arc<dyn MetricSource>,
}

impl HealthEvaluator {
    pub fn new(source: Arc<dyn MetricSource>) -> Self {
        Self { source }
    }

    /// Classify the window ending at `window_end` (epoch seconds).
    ///
    /// - query failure → `InsufficientData`, with the error as evidence;
    /// - fewer than `min_data_points` samples → `Breaching` or
    ///   `InsufficientData` per the missing-data policy;
    /// - aggregate at or above the threshold → `Breaching`;
    /// - otherwise → `Healthy`.
    pub async fn evaluate(&self, policy: &HealthPolicy, window_end: u64) -> VerdictRecord {
        let window_start = window_end.saturating_sub(policy.evaluation_window_secs);

        let result = self
            .source
            .query(&policy.metric_ref, window_start, window_end)
            .await;

        let (kind, sample, error) = match result {
            Err(e) => {
                warn!(metric = %policy.metric_ref, error = %e, "metric query failed");
                (VerdictKind::InsufficientData, None, Some(e.to_string()))
            }
            Ok(sample) if sample.count < policy.min_data_points => {
                let kind = match policy.missing_data_policy {
                    MissingDataPolicy::Breaching => VerdictKind::Breaching,
                    MissingDataPolicy::NotBreaching => VerdictKind::InsufficientData,
                };
                debug!(
                    metric = %policy.metric_ref,
                    count = sample.count,
                    required = policy.min_data_points,
                    ?kind,
                    "window below minimum data points"
                );
                (kind, Some(sample), None)
            }
            Ok(sample) if sample.aggregate >= policy.threshold => {
                warn!(
                    metric = %policy.metric_ref,
                    aggregate = sample.aggregate,
                    threshold = policy.threshold,
                    "health threshold breached"
                );
                (VerdictKind::Breaching, Some(sample), None)
            }
            Ok(sample) => (VerdictKind::Healthy, Some(sample), None),
        };

        VerdictRecord {
            kind,
            at: window_end,
            window_start,
            window_end,
            sample,
            error,
        }
    }
}

/// Tracks consecutive failed metric queries against a budget.
///
/// A successful query resets the streak; once `record_error` pushes the
/// streak past the budget, `exhausted` stays true and the controller
/// fails the deployment.
#[derive(Debug)]
pub struct ErrorStreak {
    consecutive: u32,
    budget: u32,
}

impl ErrorStreak {
    /// A streak that tolerates `budget` consecutive errors.
    pub fn new(budget: u32) -> Self {
        Self {
            consecutive: 0,
            budget,
        }
    }

    /// Record a failed query. Returns the streak length.
    pub fn record_error(&mut self) -> u32 {
        self.consecutive += 1;
        self.consecutive
    }

    /// Record a successful query, resetting the streak.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Whether the error budget is spent.
    pub fn exhausted(&self) -> bool {
        self.consecutive > self.budget
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
