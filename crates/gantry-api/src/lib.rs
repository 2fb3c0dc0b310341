//! gantry-api — REST control surface for gantry.
//!
//! Axum handlers over the state store and the deployment controller.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/versions` | Register a version |
//! | GET | `/api/v1/versions` | List versions |
//! | GET | `/api/v1/versions/:id` | Get a version |
//! | POST | `/api/v1/routes` | Create a route |
//! | GET | `/api/v1/routes` | List routes |
//! | GET | `/api/v1/routes/:name` | Get a route |
//! | GET | `/api/v1/routes/:name/history` | Deployment history for a route |
//! | POST | `/api/v1/deployments` | Start a deployment |
//! | GET | `/api/v1/deployments` | List deployment records |
//! | GET | `/api/v1/deployments/:id` | Status view for a deployment |
//! | POST | `/api/v1/deployments/:id/cancel` | Cancel a deployment |
//! | POST | `/api/v1/deployments/:id/rollback` | Operator-driven rollback |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use gantry_rollout::DeploymentController;
use gantry_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub controller: Arc<DeploymentController>,
}

/// Build the complete API router.
pub fn build_router(store: StateStore, controller: Arc<DeploymentController>) -> Router {
    let state = ApiState { store, controller };

    let api_routes = Router::new()
        .route(
            "/versions",
            get(handlers::list_versions).post(handlers::register_version),
        )
        .route("/versions/{id}", get(handlers::get_version))
        .route(
            "/routes",
            get(handlers::list_routes).post(handlers::create_route),
        )
        .route("/routes/{name}", get(handlers::get_route))
        .route("/routes/{name}/history", get(handlers::route_history))
        .route(
            "/deployments",
            get(handlers::list_deployments).post(handlers::start_deployment),
        )
        .route("/deployments/{id}", get(handlers::get_deployment))
        .route("/deployments/{id}/cancel", post(handlers::cancel_deployment))
        .route(
            "/deployments/{id}/rollback",
            post(handlers::rollback_deployment),
        )
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
