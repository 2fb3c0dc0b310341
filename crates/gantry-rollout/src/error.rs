//! Error taxonomy for rollout operations.
//!
//! Validation and admission errors surface synchronously from `start`
//! with no state mutated. Runtime failures inside a driver task never
//! surface as errors; they end the deployment in `Failed` and are
//! readable from its record and history.

use thiserror::Error;

use gantry_state::{DeploymentId, StateError};

/// Errors returned by the deployment controller's operator surface.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// Malformed schedule, rejected before any state change.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The route already has a non-terminal deployment.
    #[error("route '{route}' already has active deployment {active}")]
    ConcurrentDeployment { route: String, active: DeploymentId },

    #[error("unknown route '{0}'")]
    UnknownRoute(String),

    #[error("unknown version {0}")]
    UnknownVersion(u64),

    #[error("version {0} is not active")]
    VersionNotActive(u64),

    #[error("unknown deployment {0}")]
    UnknownDeployment(DeploymentId),

    /// The deployment is already terminal or past the point of no
    /// return (promoting).
    #[error("deployment {0} can no longer be cancelled")]
    NotCancellable(DeploymentId),

    #[error(transparent)]
    State(#[from] StateError),
}
