//! Deployment controller — drives the rollout state machine.
//!
//! One driver task per active deployment: apply the stage weight through
//! a CAS route write, bake while polling the health evaluator, then
//! advance, roll back, or promote. Cancellation is cooperative through a
//! `watch` channel and is observed within one poll interval; the bake
//! wait is a cancellable timer, never a busy loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use gantry_health::{ErrorStreak, HealthEvaluator, MetricSource};
use gantry_state::{
    DeploymentId, DeploymentRecord, DeploymentStatus, HealthPolicy, RollbackReason, Route, Stage,
    StateError, StateStore, TransitionRecord, VerdictKind, VerdictRecord, VersionId, VersionStatus,
};

use crate::error::RolloutError;
use crate::events::{DeploymentEvent, EventBus};
use crate::schedule;

/// Tuning knobs for the deployment controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Interval between health polls during a bake.
    pub poll_interval: Duration,
    /// Consecutive failed metric queries tolerated before `Failed`.
    pub max_consecutive_errors: u32,
    /// Attempts per route write beyond the first.
    pub route_write_retries: u32,
    /// Initial backoff between route-write retries; doubles per attempt.
    pub retry_backoff: Duration,
    /// Revert the route when a deployment is cancelled.
    pub revert_on_cancel: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_consecutive_errors: 3,
            route_write_retries: 3,
            retry_backoff: Duration::from_millis(500),
            revert_on_cancel: false,
        }
    }
}

/// Operator signal delivered to a driver task.
#[derive(Debug, Clone)]
enum ControlSignal {
    Run,
    Cancel,
    ForceRollback { reason: String },
}

/// Whether a driver step ended the deployment.
enum StepOutcome {
    Continue,
    Finished,
}

/// Per-deployment driver bookkeeping.
struct DriverSlot {
    handle: JoinHandle<()>,
    control_tx: watch::Sender<ControlSignal>,
}

/// Status view returned to operators: the record plus the live route.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeploymentStatusView {
    pub deployment: DeploymentRecord,
    pub route: Option<Route>,
}

/// The progressive-delivery controller.
///
/// Admission (`start`) is serialized so a route never carries two
/// non-terminal deployments; everything after admission runs on the
/// deployment's own task with no global lock.
pub struct DeploymentController {
    state: StateStore,
    evaluator: Arc<HealthEvaluator>,
    config: ControllerConfig,
    events: EventBus,
    drivers: Arc<RwLock<HashMap<DeploymentId, DriverSlot>>>,
    admission: Arc<Mutex<()>>,
}

impl DeploymentController {
    pub fn new(state: StateStore, source: Arc<dyn MetricSource>, config: ControllerConfig) -> Self {
        Self {
            state,
            evaluator: Arc::new(HealthEvaluator::new(source)),
            config,
            events: EventBus::default(),
            drivers: Arc::new(RwLock::new(HashMap::new())),
            admission: Arc::new(Mutex::new(())),
        }
    }

    /// Subscribe to deployment transition events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DeploymentEvent> {
        self.events.subscribe()
    }

    /// Start a deployment of `to_version` against `route`.
    ///
    /// Rejects synchronously, with nothing mutated, on an invalid
    /// schedule, an unknown route or version, or a route that already has
    /// a non-terminal deployment.
    pub async fn start(
        &self,
        route_name: &str,
        to_version: VersionId,
        stages: Vec<Stage>,
        policy: HealthPolicy,
    ) -> Result<DeploymentId, RolloutError> {
        schedule::validate(&stages)?;

        let route = self
            .state
            .get_route(route_name)?
            .ok_or_else(|| RolloutError::UnknownRoute(route_name.to_string()))?;
        let version = self
            .state
            .get_version(to_version)?
            .ok_or(RolloutError::UnknownVersion(to_version))?;
        if version.status != VersionStatus::Active {
            return Err(RolloutError::VersionNotActive(to_version));
        }

        // Admission is serialized: the check and the record creation must
        // not interleave with another start on the same route.
        let _guard = self.admission.lock().await;
        if let Some(active) = self.state.active_deployment_for_route(route_name)? {
            return Err(RolloutError::ConcurrentDeployment {
                route: route_name.to_string(),
                active: active.id,
            });
        }

        let record = self.state.create_deployment(DeploymentRecord {
            id: 0,
            route: route_name.to_string(),
            from_version: route.stable_version,
            to_version,
            schedule: stages,
            policy,
            stage_index: 0,
            status: DeploymentStatus::Pending,
            started_at: epoch_secs(),
            ended_at: None,
            rollback_reason: None,
            last_verdict: None,
            failure: None,
        })?;
        let id = record.id;

        let (control_tx, control_rx) = watch::channel(ControlSignal::Run);
        let driver = Driver {
            state: self.state.clone(),
            evaluator: self.evaluator.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            record,
        };
        // Hold the map lock across the spawn so a fast driver cannot try
        // to unregister itself before the slot exists.
        let mut drivers = self.drivers.write().await;
        let drivers_ref = self.drivers.clone();
        let handle = tokio::spawn(async move {
            driver.run(control_rx, drivers_ref).await;
        });
        drivers.insert(
            id,
            DriverSlot {
                handle,
                control_tx,
            },
        );
        drop(drivers);

        info!(deployment = id, route = %route_name, to_version, "deployment started");
        Ok(id)
    }

    /// Request cancellation. Cooperative: observed at the next poll tick
    /// or stage boundary.
    pub async fn cancel(&self, id: DeploymentId) -> Result<(), RolloutError> {
        self.signal(id, ControlSignal::Cancel).await
    }

    /// Request an operator-driven rollback.
    pub async fn force_rollback(&self, id: DeploymentId, reason: &str) -> Result<(), RolloutError> {
        self.signal(
            id,
            ControlSignal::ForceRollback {
                reason: reason.to_string(),
            },
        )
        .await
    }

    async fn signal(&self, id: DeploymentId, signal: ControlSignal) -> Result<(), RolloutError> {
        let record = self
            .state
            .get_deployment(id)?
            .ok_or(RolloutError::UnknownDeployment(id))?;
        // Promoting is past the point of no return: the driver no longer
        // watches the control channel, so accepting a signal here would
        // silently drop it.
        if record.is_terminal() || record.status == DeploymentStatus::Promoting {
            return Err(RolloutError::NotCancellable(id));
        }
        let drivers = self.drivers.read().await;
        match drivers.get(&id) {
            Some(slot) => {
                let _ = slot.control_tx.send(signal);
                Ok(())
            }
            // The driver already wound down; the record will be terminal
            // momentarily.
            None => Err(RolloutError::NotCancellable(id)),
        }
    }

    /// Current status: the record (stage, last verdict with evidence,
    /// terminal reason) plus the live route weights.
    pub fn status(&self, id: DeploymentId) -> Result<DeploymentStatusView, RolloutError> {
        let deployment = self
            .state
            .get_deployment(id)?
            .ok_or(RolloutError::UnknownDeployment(id))?;
        let route = self.state.get_route(&deployment.route)?;
        Ok(DeploymentStatusView { deployment, route })
    }

    /// Deployment ids with a live driver task.
    pub async fn active_drivers(&self) -> Vec<DeploymentId> {
        self.drivers.read().await.keys().copied().collect()
    }

    /// Abort all driver tasks (for shutdown). Records stay as they are;
    /// interrupted deployments require operator attention on restart.
    pub async fn stop_all(&self) {
        let mut drivers = self.drivers.write().await;
        for (id, slot) in drivers.drain() {
            slot.handle.abort();
            debug!(deployment = id, "deployment driver stopped");
        }
    }
}

/// The per-deployment driver task.
struct Driver {
    state: StateStore,
    evaluator: Arc<HealthEvaluator>,
    config: ControllerConfig,
    events: EventBus,
    record: DeploymentRecord,
}

impl Driver {
    async fn run(
        mut self,
        mut control: watch::Receiver<ControlSignal>,
        drivers: Arc<RwLock<HashMap<DeploymentId, DriverSlot>>>,
    ) {
        let id = self.record.id;
        if let Err(e) = self.drive(&mut control).await {
            error!(deployment = id, error = %e, "deployment driver hit a storage error");
            if !self.record.is_terminal() {
                self.record.failure = Some(format!("storage error: {e}"));
                let _ = self.transition(
                    DeploymentStatus::Failed,
                    self.record.stage_index,
                    format!("storage error: {e}"),
                    None,
                );
            }
        }
        drivers.write().await.remove(&id);
    }

    /// Walk the schedule to a terminal state. Returns `Err` only on
    /// storage plumbing failures; every domain outcome (rollback, cancel,
    /// promote failure) terminates the record internally.
    async fn drive(
        &mut self,
        control: &mut watch::Receiver<ControlSignal>,
    ) -> Result<(), StateError> {
        let stages = self.record.schedule.clone();
        for (index, stage) in stages.iter().enumerate() {
            // Stage boundary: honor a signal that arrived between stages.
            let signal = control.borrow().clone();
            if let StepOutcome::Finished = self.apply_signal(signal).await? {
                return Ok(());
            }

            self.transition(
                DeploymentStatus::Shifting,
                index as u32,
                format!("applying candidate weight {}", stage.weight),
                None,
            )?;

            let route_name = self.record.route.clone();
            let to_version = self.record.to_version;
            let weight = stage.weight;
            if let Err(e) = self
                .retry_route_write(|revision, now| {
                    self.state
                        .set_weights(&route_name, to_version, weight, revision, now)
                })
                .await
            {
                self.fail(format!("route weight write failed: {e}"))?;
                return Ok(());
            }

            self.transition(
                DeploymentStatus::Baking,
                index as u32,
                format!("baking at weight {} for {}s", stage.weight, stage.bake_secs),
                None,
            )?;

            if let StepOutcome::Finished = self.bake(stage, control).await? {
                return Ok(());
            }
        }

        // Last chance to observe a signal: once the record reads
        // Promoting, new cancel and rollback requests are rejected.
        let signal = control.borrow().clone();
        if let StepOutcome::Finished = self.apply_signal(signal).await? {
            return Ok(());
        }

        let last_stage = (self.record.schedule.len() - 1) as u32;
        self.transition(
            DeploymentStatus::Promoting,
            last_stage,
            "promoting candidate to stable".to_string(),
            None,
        )?;

        let route_name = self.record.route.clone();
        match self
            .retry_route_write(|revision, now| self.state.promote_route(&route_name, revision, now))
            .await
        {
            Ok(route) => self.transition(
                DeploymentStatus::Succeeded,
                last_stage,
                format!("version {} promoted to stable", route.stable_version),
                None,
            ),
            // Weights stay wherever the last confirmed write left them; an
            // unconfirmed promote is never assumed to have happened.
            Err(e) => self.fail(format!("promote failed: {e}")),
        }
    }

    /// Hold the stage weight for its bake duration, evaluating health at
    /// least once and then at every poll interval.
    async fn bake(
        &mut self,
        stage: &Stage,
        control: &mut watch::Receiver<ControlSignal>,
    ) -> Result<StepOutcome, StateError> {
        let deadline = Instant::now() + Duration::from_secs(stage.bake_secs);
        let mut streak = ErrorStreak::new(self.config.max_consecutive_errors);

        loop {
            let verdict = self.evaluator.evaluate(&self.record.policy, epoch_secs()).await;
            self.record.last_verdict = Some(verdict.clone());
            self.state.update_deployment(&self.record)?;

            match verdict.kind {
                VerdictKind::Breaching => {
                    let reason = format!(
                        "health breach at stage {}: {}",
                        self.record.stage_index,
                        describe_verdict(&verdict)
                    );
                    self.rollback(reason, Some(verdict)).await?;
                    return Ok(StepOutcome::Finished);
                }
                VerdictKind::InsufficientData if verdict.error.is_some() => {
                    streak.record_error();
                    if streak.exhausted() {
                        self.fail(format!(
                            "metric source failed {} consecutive times",
                            streak.consecutive()
                        ))?;
                        return Ok(StepOutcome::Finished);
                    }
                }
                // Healthy, or inconclusive-by-policy on a clean query.
                _ => streak.reset(),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(StepOutcome::Continue);
            }

            let tick = remaining.min(self.config.poll_interval);
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                changed = control.changed() => {
                    if changed.is_ok() {
                        let signal = control.borrow().clone();
                        if let StepOutcome::Finished = self.apply_signal(signal).await? {
                            return Ok(StepOutcome::Finished);
                        }
                    } else {
                        // Controller dropped; keep honoring the timer.
                        tokio::time::sleep(tick).await;
                    }
                }
            }
        }
    }

    async fn apply_signal(&mut self, signal: ControlSignal) -> Result<StepOutcome, StateError> {
        match signal {
            ControlSignal::Run => Ok(StepOutcome::Continue),
            ControlSignal::Cancel => {
                if self.config.revert_on_cancel {
                    let route_name = self.record.route.clone();
                    if let Err(e) = self
                        .retry_route_write(|revision, now| {
                            self.state.revert_route(&route_name, revision, now)
                        })
                        .await
                    {
                        self.fail(format!("revert on cancel failed: {e}"))?;
                        return Ok(StepOutcome::Finished);
                    }
                }
                self.transition(
                    DeploymentStatus::Cancelled,
                    self.record.stage_index,
                    "cancelled by operator".to_string(),
                    None,
                )?;
                Ok(StepOutcome::Finished)
            }
            ControlSignal::ForceRollback { reason } => {
                self.rollback(format!("operator rollback: {reason}"), None).await?;
                Ok(StepOutcome::Finished)
            }
        }
    }

    /// Revert the route and terminate in `RolledBack`, recording the
    /// triggering evidence. Irreversible: a retry is a new deployment.
    async fn rollback(
        &mut self,
        reason: String,
        evidence: Option<VerdictRecord>,
    ) -> Result<(), StateError> {
        let route_name = self.record.route.clone();
        match self
            .retry_route_write(|revision, now| self.state.revert_route(&route_name, revision, now))
            .await
        {
            Ok(_) => {
                if let Err(e) = self.state.mark_version_rolled_back(self.record.to_version) {
                    warn!(
                        deployment = self.record.id,
                        version = self.record.to_version,
                        error = %e,
                        "could not mark version rolled back"
                    );
                }
                self.record.rollback_reason = Some(RollbackReason {
                    reason: reason.clone(),
                    evidence: evidence.clone(),
                });
                self.transition(
                    DeploymentStatus::RolledBack,
                    self.record.stage_index,
                    reason,
                    evidence,
                )
            }
            // An unconfirmed revert must not be reported as done.
            Err(e) => self.fail(format!("rollback write failed: {e}")),
        }
    }

    fn fail(&mut self, reason: String) -> Result<(), StateError> {
        self.record.failure = Some(reason.clone());
        self.transition(DeploymentStatus::Failed, self.record.stage_index, reason, None)
    }

    /// Apply a route write with a fresh revision token per attempt,
    /// retrying transient failures with doubling backoff.
    async fn retry_route_write<F>(&self, mut op: F) -> Result<Route, StateError>
    where
        F: FnMut(u64, u64) -> Result<Route, StateError>,
    {
        let mut backoff = self.config.retry_backoff;
        let mut attempts = 0;
        loop {
            let revision = match self.state.get_route(&self.record.route)? {
                Some(route) => route.revision,
                None => {
                    return Err(StateError::NotFound(format!(
                        "route '{}'",
                        self.record.route
                    )));
                }
            };
            match op(revision, epoch_secs()) {
                Ok(route) => return Ok(route),
                Err(e) if is_transient(&e) && attempts < self.config.route_write_retries => {
                    attempts += 1;
                    warn!(
                        deployment = self.record.id,
                        attempt = attempts,
                        error = %e,
                        "route write retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persist the transition, append it to history, and emit an event.
    fn transition(
        &mut self,
        to: DeploymentStatus,
        stage_index: u32,
        detail: String,
        evidence: Option<VerdictRecord>,
    ) -> Result<(), StateError> {
        let from = self.record.status;
        let at = epoch_secs();
        self.record.status = to;
        self.record.stage_index = stage_index;
        if to.is_terminal() {
            self.record.ended_at = Some(at);
        }
        self.state.update_deployment(&self.record)?;
        self.state.append_history(TransitionRecord {
            deployment_id: self.record.id,
            route: self.record.route.clone(),
            seq: 0,
            at,
            from_status: from,
            to_status: to,
            detail: detail.clone(),
            evidence,
        })?;
        self.events.publish(DeploymentEvent {
            deployment_id: self.record.id,
            route: self.record.route.clone(),
            from,
            to,
            stage_index,
            at,
            detail: detail.clone(),
        });
        info!(
            deployment = self.record.id,
            route = %self.record.route,
            ?from,
            ?to,
            stage = stage_index,
            %detail,
            "deployment transition"
        );
        Ok(())
    }
}

fn describe_verdict(verdict: &VerdictRecord) -> String {
    match (&verdict.sample, &verdict.error) {
        (Some(sample), _) => format!(
            "aggregate {} over {} samples in [{}, {}]",
            sample.aggregate, sample.count, verdict.window_start, verdict.window_end
        ),
        (None, Some(error)) => format!("metric query failed: {error}"),
        (None, None) => "no sample".to_string(),
    }
}

fn is_transient(error: &StateError) -> bool {
    matches!(
        error,
        StateError::ConcurrentModification { .. }
            | StateError::Transaction(_)
            | StateError::Table(_)
            | StateError::Read(_)
            | StateError::Write(_)
    )
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
