//! fleetgrid-api: REST API for FleetGrid rollouts.
//!
//! Every route answers with the `{success, data?, error?}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/rollouts` | List rollouts |
//! | POST | `/api/v1/rollouts` | Create a rollout |
//! | GET | `/api/v1/rollouts/{id}` | Rollout with per-agent progress |
//! | GET | `/api/v1/rollouts/{id}/agents` | Per-agent progress |
//! | POST | `/api/v1/rollouts/{id}/pause` | Pause |
//! | POST | `/api/v1/rollouts/{id}/resume` | Resume |
//! | POST | `/api/v1/rollouts/{id}/advance` | Approve the next manual wave |
//! | POST | `/api/v1/rollouts/{id}/rollback` | Roll back |
//! | POST | `/api/v1/rollouts/{id}/agents/{agent_id}/report` | Agent status callback |
//! | GET | `/healthz` | Liveness |
//!
//! A create body names the strategy in tagged form, e.g.
//! `{"release_id": "rel-7", "strategy": {"type": "manual", "batch_size": 5}}`.
//! `strategy` is required; `selector` defaults to the whole fleet.

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use fleetgrid_rollout::RolloutController;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: RolloutController,
}

/// Build the complete API router.
pub fn build_router(controller: RolloutController) -> Router {
    let state = ApiState { controller };

    let api_routes = Router::new()
        .route(
            "/rollouts",
            get(handlers::list_rollouts).post(handlers::create_rollout),
        )
        .route("/rollouts/{id}", get(handlers::get_rollout))
        .route("/rollouts/{id}/agents", get(handlers::list_agents))
        .route("/rollouts/{id}/pause", post(handlers::pause_rollout))
        .route("/rollouts/{id}/resume", post(handlers::resume_rollout))
        .route("/rollouts/{id}/advance", post(handlers::advance_rollout))
        .route("/rollouts/{id}/rollback", post(handlers::rollback_rollout))
        .route(
            "/rollouts/{id}/agents/{agent_id}/report",
            post(handlers::report_agent),
        )
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
