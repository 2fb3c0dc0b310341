//! REST API handlers.
//!
//! Registry and route reads go straight to `StateStore`; deployment
//! lifecycle operations go through the `DeploymentController` so
//! admission checks and driver tasks stay in one place.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{info, warn};

use gantry_rollout::RolloutError;
use gantry_state::{DeploymentId, HealthPolicy, Stage, StateError, VersionId};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    fn created(data: T) -> impl IntoResponse
    where
        T: 'static,
    {
        (StatusCode::CREATED, Self::ok(data))
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse + use<> {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn state_error(e: &StateError) -> impl IntoResponse {
    let status = match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::ConcurrentModification { .. }
        | StateError::DuplicateArtifact { .. }
        | StateError::AlreadyExists(_)
        | StateError::StillReferenced(..) => StatusCode::CONFLICT,
        StateError::VersionNotActive(_)
        | StateError::NoCandidate(_)
        | StateError::InvalidWeight(_)
        | StateError::InvalidRouteName(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

fn rollout_error(e: &RolloutError) -> impl IntoResponse {
    let status = match e {
        RolloutError::InvalidSchedule(_) | RolloutError::VersionNotActive(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        RolloutError::ConcurrentDeployment { .. } | RolloutError::NotCancellable(_) => {
            StatusCode::CONFLICT
        }
        RolloutError::UnknownRoute(_)
        | RolloutError::UnknownVersion(_)
        | RolloutError::UnknownDeployment(_) => StatusCode::NOT_FOUND,
        RolloutError::State(e) => return state_error(e).into_response(),
    };
    error_response(&e.to_string(), status).into_response()
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Versions ───────────────────────────────────────────────────

/// Request body to register a version.
#[derive(serde::Deserialize)]
pub struct RegisterVersionRequest {
    pub artifact_ref: String,
}

/// POST /api/v1/versions
pub async fn register_version(
    State(state): State<ApiState>,
    Json(req): Json<RegisterVersionRequest>,
) -> impl IntoResponse {
    match state.store.register_version(&req.artifact_ref, epoch_secs()) {
        Ok(version) => {
            info!(id = version.id, "version registered via api");
            ApiResponse::created(version).into_response()
        }
        Err(e) => state_error(&e).into_response(),
    }
}

/// GET /api/v1/versions
pub async fn list_versions(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_versions() {
        Ok(versions) => ApiResponse::ok(versions).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// GET /api/v1/versions/:id
pub async fn get_version(
    State(state): State<ApiState>,
    Path(id): Path<VersionId>,
) -> impl IntoResponse {
    match state.store.get_version(id) {
        Ok(Some(version)) => ApiResponse::ok(version).into_response(),
        Ok(None) => error_response("version not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

// ── Routes ─────────────────────────────────────────────────────

/// Request body to create a route.
#[derive(serde::Deserialize)]
pub struct CreateRouteRequest {
    pub name: String,
    pub initial_version: VersionId,
}

/// POST /api/v1/routes
pub async fn create_route(
    State(state): State<ApiState>,
    Json(req): Json<CreateRouteRequest>,
) -> impl IntoResponse {
    match state
        .store
        .create_route(&req.name, req.initial_version, epoch_secs())
    {
        Ok(route) => {
            info!(name = %route.name, version = route.stable_version, "route created via api");
            ApiResponse::created(route).into_response()
        }
        Err(e) => state_error(&e).into_response(),
    }
}

/// GET /api/v1/routes
pub async fn list_routes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_routes() {
        Ok(routes) => ApiResponse::ok(routes).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// GET /api/v1/routes/:name
pub async fn get_route(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.get_route(&name) {
        Ok(Some(route)) => ApiResponse::ok(route).into_response(),
        Ok(None) => error_response("route not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// GET /api/v1/routes/:name/history
pub async fn route_history(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.get_route(&name) {
        Ok(Some(_)) => match state.store.list_history(&name) {
            Ok(history) => ApiResponse::ok(history).into_response(),
            Err(e) => state_error(&e).into_response(),
        },
        Ok(None) => error_response("route not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

// ── Deployments ────────────────────────────────────────────────

/// Request body to start a deployment.
#[derive(serde::Deserialize)]
pub struct StartDeploymentRequest {
    pub route: String,
    pub to_version: VersionId,
    pub schedule: Vec<Stage>,
    pub policy: HealthPolicy,
}

/// Body returned by a successful deployment start.
#[derive(serde::Serialize)]
pub struct DeploymentStarted {
    pub id: DeploymentId,
}

/// POST /api/v1/deployments
pub async fn start_deployment(
    State(state): State<ApiState>,
    Json(req): Json<StartDeploymentRequest>,
) -> impl IntoResponse {
    match state
        .controller
        .start(&req.route, req.to_version, req.schedule, req.policy)
        .await
    {
        Ok(id) => {
            info!(deployment = id, route = %req.route, "deployment started via api");
            ApiResponse::created(DeploymentStarted { id }).into_response()
        }
        Err(e) => {
            warn!(route = %req.route, error = %e, "deployment start rejected");
            rollout_error(&e).into_response()
        }
    }
}

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_deployments() {
        Ok(deployments) => ApiResponse::ok(deployments).into_response(),
        Err(e) => state_error(&e).into_response(),
    }
}

/// GET /api/v1/deployments/:id
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path(id): Path<DeploymentId>,
) -> impl IntoResponse {
    match state.controller.status(id) {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => rollout_error(&e).into_response(),
    }
}

/// POST /api/v1/deployments/:id/cancel
pub async fn cancel_deployment(
    State(state): State<ApiState>,
    Path(id): Path<DeploymentId>,
) -> impl IntoResponse {
    match state.controller.cancel(id).await {
        Ok(()) => {
            info!(deployment = id, "cancel requested via api");
            ApiResponse::ok(DeploymentStarted { id }).into_response()
        }
        Err(e) => rollout_error(&e).into_response(),
    }
}

/// Request body for an operator-driven rollback.
#[derive(serde::Deserialize)]
pub struct RollbackRequest {
    pub reason: String,
}

/// POST /api/v1/deployments/:id/rollback
pub async fn rollback_deployment(
    State(state): State<ApiState>,
    Path(id): Path<DeploymentId>,
    Json(req): Json<RollbackRequest>,
) -> impl IntoResponse {
    match state.controller.force_rollback(id, &req.reason).await {
        Ok(()) => {
            info!(deployment = id, reason = %req.reason, "rollback requested via api");
            ApiResponse::ok(DeploymentStarted { id }).into_response()
        }
        Err(e) => rollout_error(&e).into_response(),
    }
}
