//! Standalone regression tests.
//!
//! Drives the REST API against a controller backed by an in-memory store
//! and fleet, ticking rollouts by hand in between requests.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use fleetgrid_api::build_router;
use fleetgrid_rollout::{
    AgentRegistry, InMemoryFleet, ReleaseCatalog, RolloutConfig, RolloutController,
};
use fleetgrid_state::*;
use serde_json::{Value, json};
use tower::ServiceExt;

fn test_fleet(agents: usize, auto_apply: bool) -> InMemoryFleet {
    let fleet = InMemoryFleet::new().with_auto_apply(auto_apply);
    for i in 0..agents {
        fleet.add_agent(AgentSnapshot {
            id: format!("agent-{i:02}"),
            name: format!("agent-{i:02}.dc1"),
            current_version: "1.4.0".to_string(),
            region: if i % 2 == 0 { "eu-west" } else { "us-east" }.to_string(),
            tags: vec!["edge".to_string()],
        });
    }
    fleet.add_release(Release {
        id: "rel-1.5".to_string(),
        version: "1.5.0".to_string(),
        status: ReleaseStatus::Available,
        created_at: 1000,
    });
    fleet.add_release(Release {
        id: "rel-old".to_string(),
        version: "1.3.0".to_string(),
        status: ReleaseStatus::Deprecated,
        created_at: 500,
    });
    fleet
}

fn test_controller(fleet: &InMemoryFleet) -> RolloutController {
    let registry: Arc<dyn AgentRegistry> = Arc::new(fleet.clone());
    let catalog: Arc<dyn ReleaseCatalog> = Arc::new(fleet.clone());
    let config = RolloutConfig {
        command_timeout: Duration::from_millis(200),
        lock_timeout: Duration::from_millis(50),
        catch_up: false,
        ..RolloutConfig::default()
    };
    RolloutController::new(StateStore::open_in_memory().unwrap(), registry, catalog, config)
        .unwrap()
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn create(router: &Router, body: Value) -> String {
    let (status, value) = send(router, "POST", "/api/v1/rollouts", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{value}");
    value["data"]["id"].as_str().unwrap().to_string()
}

/// Tick until the rollout reaches a terminal status or the budget runs out.
async fn tick_until_terminal(controller: &RolloutController, id: &str) -> RolloutStatus {
    for _ in 0..50 {
        controller.tick(id).await.unwrap();
        let status = controller.get(id).unwrap().rollout.status;
        if status.is_terminal() {
            return status;
        }
    }
    controller.get(id).unwrap().rollout.status
}

#[tokio::test]
async fn standalone_api_healthz() {
    let fleet = test_fleet(0, true);
    let router = build_router(test_controller(&fleet));

    let (status, body) = send(&router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true, "data": "ok"}));
}

#[tokio::test]
async fn standalone_api_list_rollouts_empty() {
    let fleet = test_fleet(3, true);
    let router = build_router(test_controller(&fleet));

    let (status, body) = send(&router, "GET", "/api/v1/rollouts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn standalone_staged_rollout_runs_to_completion() {
    let fleet = test_fleet(10, true);
    let controller = test_controller(&fleet);
    let router = build_router(controller.clone());

    let id = create(
        &router,
        json!({"release_id": "rel-1.5", "strategy": {"type": "staged"}}),
    )
    .await;

    let (status, body) = send(&router, "GET", &format!("/api/v1/rollouts/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["rollout"]["status"], "pending");
    assert_eq!(body["data"]["rollout"]["total_waves"], 4);
    assert_eq!(body["data"]["rollout"]["agents_total"], 10);

    assert_eq!(tick_until_terminal(&controller, &id).await, RolloutStatus::Completed);

    let (status, body) = send(&router, "GET", &format!("/api/v1/rollouts/{id}/agents"), None).await;
    assert_eq!(status, StatusCode::OK);
    let agents = body["data"].as_array().unwrap();
    assert_eq!(agents.len(), 10);
    assert!(agents.iter().all(|a| a["status"] == "updated"));
    assert_eq!(fleet.version_of("agent-07").as_deref(), Some("1.5.0"));

    let (_, body) = send(&router, "GET", "/api/v1/rollouts", None).await;
    assert_eq!(body["data"][0]["agents_updated"], 10);
}

#[tokio::test]
async fn standalone_selector_limits_rollout() {
    let fleet = test_fleet(6, true);
    let router = build_router(test_controller(&fleet));

    let id = create(
        &router,
        json!({
            "release_id": "rel-1.5",
            "strategy": {"type": "immediate"},
            "selector": {"regions": ["us-east"]}
        }),
    )
    .await;

    let (_, body) = send(&router, "GET", &format!("/api/v1/rollouts/{id}"), None).await;
    assert_eq!(body["data"]["rollout"]["agents_total"], 3);
}

#[tokio::test]
async fn standalone_create_rejects_bad_requests() {
    let fleet = test_fleet(3, true);
    let router = build_router(test_controller(&fleet));

    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/rollouts",
        Some(json!({"release_id": "rel-old", "strategy": {"type": "staged"}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = send(
        &router,
        "POST",
        "/api/v1/rollouts",
        Some(json!({"release_id": "rel-1.5", "strategy": {"type": "manual", "batch_size": 0}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Strategy is required and uses the tagged form.
    for body in [
        json!({"release_id": "rel-1.5"}),
        json!({"release_id": "rel-1.5", "strategy": "canary"}),
    ] {
        let (status, body) = send(&router, "POST", "/api/v1/rollouts", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    // Malformed body still answers with the envelope.
    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/rollouts",
        Some(json!({"strategy": "sideways"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());

    let (_, body) = send(&router, "GET", "/api/v1/rollouts", None).await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn standalone_pause_resume_and_conflicts() {
    let fleet = test_fleet(10, false);
    let controller = test_controller(&fleet);
    let router = build_router(controller.clone());
    let id = create(&router, json!({"release_id": "rel-1.5", "strategy": {"type": "staged"}})).await;

    let (status, _) = send(&router, "POST", &format!("/api/v1/rollouts/{id}/pause"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    controller.tick(&id).await.unwrap();

    let (status, body) = send(&router, "POST", &format!("/api/v1/rollouts/{id}/pause"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "paused");

    let (status, _) = send(&router, "POST", &format!("/api/v1/rollouts/{id}/pause"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&router, "POST", &format!("/api/v1/rollouts/{id}/resume"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "in_progress");

    let (status, _) = send(&router, "POST", "/api/v1/rollouts/missing/resume", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn standalone_rollback_sends_agents_back() {
    let fleet = test_fleet(4, true);
    let controller = test_controller(&fleet);
    let router = build_router(controller.clone());
    let id = create(
        &router,
        json!({"release_id": "rel-1.5", "strategy": {"type": "immediate"}}),
    )
    .await;
    controller.tick(&id).await.unwrap();
    assert_eq!(fleet.version_of("agent-00").as_deref(), Some("1.5.0"));

    let (status, _) = send(
        &router,
        "POST",
        &format!("/api/v1/rollouts/{id}/rollback"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &router,
        "POST",
        &format!("/api/v1/rollouts/{id}/rollback"),
        Some(json!({"reason": "latency regression"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "rolled_back");
    assert_eq!(fleet.version_of("agent-00").as_deref(), Some("1.4.0"));

    // The scheduler keeps confirming downgrades after the rollout is terminal.
    controller.tick(&id).await.unwrap();
    let (_, body) = send(&router, "GET", &format!("/api/v1/rollouts/{id}/agents"), None).await;
    for agent in body["data"].as_array().unwrap() {
        assert_eq!(agent["status"], "updated");
        assert_eq!(agent["to_version"], "1.4.0");
        assert_eq!(agent["rollback"], true);
    }

    let (status, _) = send(
        &router,
        "POST",
        &format!("/api/v1/rollouts/{id}/rollback"),
        Some(json!({"reason": "again"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn standalone_manual_rollout_needs_advance() {
    let fleet = test_fleet(4, true);
    let controller = test_controller(&fleet);
    let router = build_router(controller.clone());
    let id = create(
        &router,
        json!({"release_id": "rel-1.5", "strategy": {"type": "manual", "batch_size": 2}}),
    )
    .await;

    controller.tick(&id).await.unwrap(); // wave 1 issued
    controller.tick(&id).await.unwrap(); // wave 1 confirmed, waiting
    controller.tick(&id).await.unwrap();
    let (_, body) = send(&router, "GET", &format!("/api/v1/rollouts/{id}"), None).await;
    assert_eq!(body["data"]["rollout"]["current_wave"], 1);
    assert_eq!(body["data"]["rollout"]["agents_updated"], 2);

    let (status, body) = send(&router, "POST", &format!("/api/v1/rollouts/{id}/advance"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["approved_wave"], 2);

    let (status, _) = send(&router, "POST", &format!("/api/v1/rollouts/{id}/advance"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    assert_eq!(tick_until_terminal(&controller, &id).await, RolloutStatus::Completed);
}

#[tokio::test]
async fn standalone_agent_report_settles_update() {
    let fleet = test_fleet(2, false);
    let controller = test_controller(&fleet);
    let router = build_router(controller.clone());
    let id = create(
        &router,
        json!({"release_id": "rel-1.5", "strategy": {"type": "immediate"}}),
    )
    .await;
    controller.tick(&id).await.unwrap();

    let (status, body) = send(
        &router,
        "POST",
        &format!("/api/v1/rollouts/{id}/agents/agent-01/report"),
        Some(json!({"version": "1.5.0"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "updated");

    let (status, _) = send(
        &router,
        "POST",
        &format!("/api/v1/rollouts/{id}/agents/nobody/report"),
        Some(json!({"version": "1.5.0"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn standalone_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fleetgrid.redb");
    let fleet = test_fleet(10, true);

    let id = {
        let store = StateStore::open(&db_path).unwrap();
        let registry: Arc<dyn AgentRegistry> = Arc::new(fleet.clone());
        let catalog: Arc<dyn ReleaseCatalog> = Arc::new(fleet.clone());
        let controller =
            RolloutController::new(store, registry, catalog, RolloutConfig::default()).unwrap();
        let router = build_router(controller.clone());
        let id = create(&router, json!({"release_id": "rel-1.5", "strategy": {"type": "staged"}})).await;
        controller.tick(&id).await.unwrap();
        id
    };

    let store = StateStore::open(&db_path).unwrap();
    let registry: Arc<dyn AgentRegistry> = Arc::new(fleet.clone());
    let catalog: Arc<dyn ReleaseCatalog> = Arc::new(fleet.clone());
    let controller =
        RolloutController::new(store, registry, catalog, RolloutConfig::default()).unwrap();
    assert_eq!(controller.active_rollout_ids().unwrap(), vec![id.clone()]);

    let router = build_router(controller.clone());
    let (_, body) = send(&router, "GET", &format!("/api/v1/rollouts/{id}"), None).await;
    assert_eq!(body["data"]["rollout"]["status"], "in_progress");
    assert_eq!(body["data"]["rollout"]["current_wave"], 1);

    assert_eq!(tick_until_terminal(&controller, &id).await, RolloutStatus::Completed);
}
