//! Integration tests for the opost-hub HTTP API
//!
//! Exercises routing and the full letter journey over HTTP: appoint a
//! hierarchy, issue and bind a code, claim the task, scan pickup and
//! delivery, and verify the audit trail and emitted events.

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use opost_common::config::HubSettings;
use opost_common::db::init_database;
use opost_common::events::{EventBus, OpostEvent};
use opost_common::opcode::OpCodeAuthority;
use opost_common::signing::CodeSigner;
use opost_hub::{build_router, AppState};
use serde_json::{json, Value};
use tower::util::ServiceExt;

/// App over a fresh temp-file database, auth disabled (shared_secret = 0)
async fn setup() -> (axum::Router, AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = init_database(&dir.path().join("opost.db"))
        .await
        .expect("init database");
    let settings = HubSettings::load(&pool).await.expect("settings");

    let state = AppState::new(
        pool,
        EventBus::new(256),
        CodeSigner::new("integration-secret"),
        OpCodeAuthority::Permissive,
        0,
        settings,
    );
    (build_router(state.clone()), state, dir)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.expect("read body");
    serde_json::from_slice(&bytes).expect("parse JSON")
}

async fn post_ok(app: &axum::Router, uri: &str, body: &Value) -> Value {
    let response = app.clone().oneshot(post(uri, body)).await.unwrap();
    let status = response.status();
    let json = extract_json(response.into_body()).await;
    assert_eq!(status, StatusCode::OK, "POST {} failed: {}", uri, json);
    json
}

/// Appoint City > School > Zone > Building over the API; returns their ids
async fn seed_hierarchy(app: &axum::Router, state: &AppState) -> (String, String, String, String) {
    // City bootstrap is an admin operation, not an HTTP route
    let city = state.registry.create_root("PKU").await.unwrap();

    let school = post_ok(
        app,
        "/api/couriers",
        &json!({"actor_id": city.id, "tier": "School", "zone_code": "PKU"}),
    )
    .await;
    let zone = post_ok(
        app,
        "/api/couriers",
        &json!({"actor_id": school["id"], "tier": "Zone", "zone_code": "PKU-A1"}),
    )
    .await;
    let building = post_ok(
        app,
        "/api/couriers",
        &json!({"actor_id": zone["id"], "tier": "Building", "zone_code": "PKU-A1-03"}),
    )
    .await;

    (
        city.id,
        school["id"].as_str().unwrap().to_string(),
        zone["id"].as_str().unwrap().to_string(),
        building["id"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _state, _dir) = setup().await;

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "opost-hub");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_full_letter_journey() {
    let (app, state, _dir) = setup().await;
    let (_city, _school, _zone, building) = seed_hierarchy(&app, &state).await;
    let mut rx = state.events.subscribe();

    let issued = post_ok(&app, "/api/codes", &json!({})).await;
    let code = issued["code"].as_str().unwrap().to_string();
    let signature = issued["signature"].as_str().unwrap().to_string();

    let bound = post_ok(
        &app,
        "/api/codes/bind",
        &json!({
            "code": code,
            "recipient_op_code": "PKU-B2-01",
            "sender_op_code": "PKU-A1-03",
            "priority": 1
        }),
    )
    .await;
    assert_eq!(bound["code"]["status"], "bound");
    assert_eq!(bound["task"]["status"], "pending");
    let task_id = bound["task"]["id"].as_str().unwrap().to_string();

    // The building courier sees and claims the task
    let visible = app
        .clone()
        .oneshot(get(&format!("/api/tasks?courier_id={}", building)))
        .await
        .unwrap();
    assert_eq!(visible.status(), StatusCode::OK);
    let tasks = extract_json(visible.into_body()).await;
    assert_eq!(tasks.as_array().unwrap().len(), 1);

    let claimed = post_ok(
        &app,
        "/api/tasks/claim",
        &json!({"courier_id": building, "task_id": task_id}),
    )
    .await;
    assert_eq!(claimed["status"], "assigned");

    let pickup = post_ok(
        &app,
        "/api/scan",
        &json!({
            "code": code,
            "signature": signature,
            "courier_id": building,
            "action": "pickup",
            "location": "dorm gate"
        }),
    )
    .await;
    assert_eq!(pickup["code_status"], "in_transit");
    assert_eq!(pickup["replay"], false);

    let delivery = post_ok(
        &app,
        "/api/scan",
        &json!({
            "code": code,
            "signature": signature,
            "courier_id": building,
            "action": "delivery"
        }),
    )
    .await;
    assert_eq!(delivery["code_status"], "delivered");
    assert_eq!(delivery["task_status"], "delivered");

    // Final state over the read API
    let response = app
        .clone()
        .oneshot(get(&format!("/api/codes/{}", code)))
        .await
        .unwrap();
    let row = extract_json(response.into_body()).await;
    assert_eq!(row["status"], "delivered");
    assert_eq!(row["scan_count"], 2);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/codes/{}/history", code)))
        .await
        .unwrap();
    let history = extract_json(response.into_body()).await;
    assert_eq!(history.as_array().unwrap().len(), 2);

    // Exactly one completion event, carrying base credit plus priority
    let completions: Vec<i64> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|e| match e {
            OpostEvent::TaskCompleted { points, .. } => Some(points),
            _ => None,
        })
        .collect();
    assert_eq!(completions, vec![11]);
}

#[tokio::test]
async fn test_duplicate_scan_is_idempotent_over_http() {
    let (app, state, _dir) = setup().await;
    let (_city, _school, _zone, building) = seed_hierarchy(&app, &state).await;

    let issued = post_ok(&app, "/api/codes", &json!({})).await;
    let code = issued["code"].as_str().unwrap();
    let signature = issued["signature"].as_str().unwrap();

    let bound = post_ok(
        &app,
        "/api/codes/bind",
        &json!({
            "code": code,
            "recipient_op_code": "PKU-B2-01",
            "sender_op_code": "PKU-A1-03"
        }),
    )
    .await;
    let task_id = bound["task"]["id"].as_str().unwrap();
    post_ok(
        &app,
        "/api/tasks/claim",
        &json!({"courier_id": building, "task_id": task_id}),
    )
    .await;

    let scan_body = json!({
        "code": code,
        "signature": signature,
        "courier_id": building,
        "action": "pickup"
    });
    let first = post_ok(&app, "/api/scan", &scan_body).await;
    let second = post_ok(&app, "/api/scan", &scan_body).await;

    assert_eq!(first["replay"], false);
    assert_eq!(second["replay"], true);
    assert_eq!(second["scan_id"], first["scan_id"]);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/codes/{}", code)))
        .await
        .unwrap();
    let row = extract_json(response.into_body()).await;
    assert_eq!(row["scan_count"], 1);
}

#[tokio::test]
async fn test_tampered_signature_rejected_and_code_burned() {
    let (app, state, _dir) = setup().await;
    let (_city, _school, _zone, building) = seed_hierarchy(&app, &state).await;

    let issued = post_ok(&app, "/api/codes", &json!({})).await;
    let code = issued["code"].as_str().unwrap();

    post_ok(
        &app,
        "/api/codes/bind",
        &json!({
            "code": code,
            "recipient_op_code": "PKU-B2-01",
            "sender_op_code": "PKU-A1-03"
        }),
    )
    .await;

    let response = app
        .clone()
        .oneshot(post(
            "/api/scan",
            &json!({
                "code": code,
                "signature": "forged",
                "courier_id": building,
                "action": "pickup"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/codes/{}", code)))
        .await
        .unwrap();
    let row = extract_json(response.into_body()).await;
    assert_eq!(row["status"], "invalid");
}

#[tokio::test]
async fn test_double_bind_conflicts() {
    let (app, state, _dir) = setup().await;
    seed_hierarchy(&app, &state).await;

    let issued = post_ok(&app, "/api/codes", &json!({})).await;
    let code = issued["code"].as_str().unwrap();
    let bind_body = json!({
        "code": code,
        "recipient_op_code": "PKU-B2-01",
        "sender_op_code": "PKU-A1-03"
    });

    post_ok(&app, "/api/codes/bind", &bind_body).await;
    let response = app.clone().oneshot(post("/api/codes/bind", &bind_body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_second_claim_conflicts() {
    let (app, state, _dir) = setup().await;
    let (_city, _school, zone, building) = seed_hierarchy(&app, &state).await;

    let issued = post_ok(&app, "/api/codes", &json!({})).await;
    let bound = post_ok(
        &app,
        "/api/codes/bind",
        &json!({
            "code": issued["code"],
            "recipient_op_code": "PKU-B2-01",
            "sender_op_code": "PKU-A1-03"
        }),
    )
    .await;
    let task_id = bound["task"]["id"].as_str().unwrap();

    post_ok(
        &app,
        "/api/tasks/claim",
        &json!({"courier_id": building, "task_id": task_id}),
    )
    .await;

    let response = app
        .clone()
        .oneshot(post(
            "/api/tasks/claim",
            &json!({"courier_id": zone, "task_id": task_id}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_batch_requires_zone_authority() {
    let (app, state, _dir) = setup().await;
    let (_city, _school, zone, building) = seed_hierarchy(&app, &state).await;

    // Building tier lacks authority to print zone stock
    let response = app
        .clone()
        .oneshot(post(
            "/api/codes/batch",
            &json!({"actor_id": building, "zone": "PKU-A1", "count": 3}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let batch = post_ok(
        &app,
        "/api/codes/batch",
        &json!({"actor_id": zone, "zone": "PKU-A1", "count": 3}),
    )
    .await;
    let codes = batch["codes"].as_array().unwrap();
    assert_eq!(codes.len(), 3);
    for issued in codes {
        let token = issued["code"].as_str().unwrap();
        assert!(token.starts_with("OPP-PKU-A1-"));
    }
}

#[tokio::test]
async fn test_unknown_resources_are_404() {
    let (app, _state, _dir) = setup().await;

    let response = app.clone().oneshot(get("/api/codes/NOSUCHCODE1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.clone().oneshot(get("/api/tasks/no-such-task")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.clone().oneshot(get("/api/couriers/no-such-courier")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_find_responsible_endpoint() {
    let (app, state, _dir) = setup().await;
    let (_city, school, zone, building) = seed_hierarchy(&app, &state).await;

    let response = app
        .clone()
        .oneshot(get("/api/couriers/responsible?op_code=PKU-A1-03"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let found = extract_json(response.into_body()).await;
    assert_eq!(found["id"], building.as_str());

    let response = app
        .clone()
        .oneshot(get("/api/couriers/responsible?op_code=PKU-A1-07"))
        .await
        .unwrap();
    let found = extract_json(response.into_body()).await;
    assert_eq!(found["id"], zone.as_str());

    let response = app
        .clone()
        .oneshot(get("/api/couriers/responsible?op_code=PKU-Z9-01"))
        .await
        .unwrap();
    let found = extract_json(response.into_body()).await;
    assert_eq!(found["id"], school.as_str());

    let response = app
        .clone()
        .oneshot(get("/api/couriers/responsible?op_code=THU-X1"))
        .await
        .unwrap();
    let found = extract_json(response.into_body()).await;
    assert!(found.is_null());
}

#[tokio::test]
async fn test_appoint_outside_zone_forbidden() {
    let (app, state, _dir) = setup().await;
    let (_city, school, _zone, _building) = seed_hierarchy(&app, &state).await;

    let response = app
        .clone()
        .oneshot(post(
            "/api/couriers",
            &json!({"actor_id": school, "tier": "Zone", "zone_code": "THU-Z1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
