//! Domain types for the Gantry state store.
//!
//! These types represent the persisted state of the version registry,
//! routes, deployment records, and transition history. All types are
//! serializable to/from JSON for storage in redb tables. Timestamps are
//! unix epoch seconds throughout.

use serde::{Deserialize, Serialize};

/// Unique identifier for a registered version.
pub type VersionId = u64;

/// Unique identifier for a deployment attempt.
pub type DeploymentId = u64;

// ── Version registry ───────────────────────────────────────────────

/// An immutable reference to a deployable artifact.
///
/// Never mutated after creation except for its `status`, which moves to
/// `RolledBack` when a deployment backed out of it and to `Deleted` when
/// garbage collection tombstones it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Version {
    pub id: VersionId,
    /// Opaque artifact handle. Gantry never inspects its contents.
    pub artifact_ref: String,
    /// Hex SHA-256 of the artifact ref; duplicate-registration key.
    pub fingerprint: String,
    pub created_at: u64,
    pub status: VersionStatus,
}

/// Lifecycle status of a registered version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Active,
    RolledBack,
    Deleted,
}

// ── Route ──────────────────────────────────────────────────────────

/// A named, weighted pointer that splits traffic between a stable version
/// and at most one candidate.
///
/// Invariant: `stable_weight() + candidate_weight == 100` at all times.
/// The `revision` token is the optimistic-concurrency mechanism: every
/// write must present the current revision and every successful write
/// increments it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub name: String,
    pub stable_version: VersionId,
    pub candidate_version: Option<VersionId>,
    /// Percentage of traffic sent to the candidate, in [0, 100].
    pub candidate_weight: u8,
    pub revision: u64,
    pub updated_at: u64,
}

impl Route {
    /// Percentage of traffic sent to the stable version.
    pub fn stable_weight(&self) -> u8 {
        100 - self.candidate_weight
    }

    /// Whether the route currently carries a candidate.
    pub fn has_candidate(&self) -> bool {
        self.candidate_version.is_some()
    }
}

// ── Health policy and verdicts ─────────────────────────────────────

/// How to classify a window with fewer than `min_data_points` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingDataPolicy {
    /// Missing data is treated as a breach.
    Breaching,
    /// Missing data is inconclusive.
    NotBreaching,
}

/// What to measure during a bake and where to draw the line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthPolicy {
    /// Opaque metric identifier passed to the metric source.
    pub metric_ref: String,
    /// Aggregate at or above this value is breaching.
    pub threshold: f64,
    /// Length of the lookback window, in seconds.
    pub evaluation_window_secs: u64,
    /// Minimum sample count for a conclusive verdict.
    pub min_data_points: u64,
    pub missing_data_policy: MissingDataPolicy,
}

/// Raw aggregate returned by a metric source for one window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub count: u64,
    pub aggregate: f64,
}

/// Classification of one evaluation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Healthy,
    Breaching,
    InsufficientData,
}

/// A verdict together with the evidence that produced it.
///
/// `sample` is the raw window aggregate when the query succeeded; `error`
/// carries the query failure otherwise. Kept on the deployment record and
/// in history so a rollback can always be reconstructed post-mortem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerdictRecord {
    pub kind: VerdictKind,
    pub at: u64,
    pub window_start: u64,
    pub window_end: u64,
    pub sample: Option<MetricSample>,
    pub error: Option<String>,
}

// ── Deployment ─────────────────────────────────────────────────────

/// One stage of a weight-shift schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    /// Candidate traffic weight applied at this stage, in [0, 100].
    pub weight: u8,
    /// How long to hold this weight while observing health.
    pub bake_secs: u64,
}

/// Status of a deployment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Shifting,
    Baking,
    Promoting,
    Succeeded,
    RolledBack,
    Cancelled,
    Failed,
}

impl DeploymentStatus {
    /// Terminal statuses are immutable; a retry is always a new deployment.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::RolledBack | Self::Cancelled | Self::Failed
        )
    }
}

/// Why a deployment rolled back, with the triggering evidence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackReason {
    pub reason: String,
    /// The verdict that triggered the rollback, when health-driven.
    pub evidence: Option<VerdictRecord>,
}

/// One rollout attempt against a route. Created by an operator action,
/// mutated only by the controller, never reused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub route: String,
    pub from_version: VersionId,
    pub to_version: VersionId,
    pub schedule: Vec<Stage>,
    pub policy: HealthPolicy,
    /// Index of the stage currently shifting or baking.
    pub stage_index: u32,
    pub status: DeploymentStatus,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub rollback_reason: Option<RollbackReason>,
    /// Most recent health verdict observed during baking.
    pub last_verdict: Option<VerdictRecord>,
    /// Terminal failure description when `status == Failed`.
    pub failure: Option<String>,
}

impl DeploymentRecord {
    /// Whether the record has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ── History ────────────────────────────────────────────────────────

/// One state transition in the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRecord {
    pub deployment_id: DeploymentId,
    pub route: String,
    /// Per-deployment sequence number, assigned on append.
    pub seq: u64,
    pub at: u64,
    pub from_status: DeploymentStatus,
    pub to_status: DeploymentStatus,
    pub detail: String,
    /// Health evidence attached to rollback transitions.
    pub evidence: Option<VerdictRecord>,
}

impl TransitionRecord {
    /// Build the composite key for the history table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}:{:06}", self.route, self.deployment_id, self.seq)
    }
}
