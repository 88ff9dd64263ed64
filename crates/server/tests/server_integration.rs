//! Integration tests for the HTTP surface.

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{EngineConfig, FailurePolicy, InMemoryBroker, Orchestrator};
use saga_store::{DeadLetterRecord, DeadLetterSink, InMemorySagaStore, ProcessId};
use serde_json::{Value, json};
use server::AppState;
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup() -> (axum::Router, InMemorySagaStore) {
    let store = InMemorySagaStore::new();
    let orchestrator = Orchestrator::new(
        store.clone(),
        server::default_registry().unwrap(),
        EngineConfig::new(FailurePolicy::FailClosed),
    );
    let (engine, _tasks) = saga::engine::spawn(orchestrator.clone(), InMemoryBroker::new());
    let state = Arc::new(AppState {
        orchestrator,
        engine,
        metrics: get_metrics_handle(),
    });
    (server::create_app(state), store)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn start_order(app: &axum::Router, id: &str) -> (StatusCode, Value) {
    send(
        app,
        json_request(
            "POST",
            "/processes",
            json!({
                "process_id": id,
                "process_type": "OrderFulfillment",
                "data": {"order_id": id, "amount_cents": 4500}
            }),
        ),
    )
    .await
}

fn reply(id: &str, step: &str, outcome: Value) -> Value {
    json!({
        "process_id": id,
        "step_name": step,
        "kind": "execute",
        "attempt": 1,
        "outcome": outcome
    })
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = setup();

    let (status, json) = send(&app, get_request("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["outbox_pending"], 0);
}

#[tokio::test]
async fn test_health_reports_unreachable_store() {
    let (app, store) = setup();
    store.set_unavailable(true);

    let (status, json) = send(&app, get_request("/health")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "store_unavailable");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = setup();

    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_start_process() {
    let (app, _) = setup();

    let (status, json) = start_order(&app, "order-1").await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["process_id"], "order-1");
    assert_eq!(json["status"], "running");
    assert_eq!(json["current_step"], "ReserveInventory");
    assert_eq!(json["data"]["amount_cents"], 4500);
    assert_eq!(json["history"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_start_generates_process_id() {
    let (app, _) = setup();

    let (status, json) = send(
        &app,
        json_request("POST", "/processes", json!({"process_type": "OrderFulfillment"})),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert!(!json["process_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_start_rejects_duplicates_and_unknown_types() {
    let (app, _) = setup();
    start_order(&app, "order-1").await;

    let (status, _) = start_order(&app, "order-1").await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, json) = send(
        &app,
        json_request("POST", "/processes", json!({"process_type": "Unknown"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("Unknown"));

    let (status, json) = start_order(&app, "order:2").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("order:2"));
}

#[tokio::test]
async fn test_get_process() {
    let (app, _) = setup();
    start_order(&app, "order-1").await;

    let (status, json) = send(&app, get_request("/processes/order-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["process_type"], "OrderFulfillment");

    let (status, _) = send(&app, get_request("/processes/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_event_advances_saga_and_duplicates_are_flagged() {
    let (app, _) = setup();
    start_order(&app, "order-1").await;
    let event = reply(
        "order-1",
        "ReserveInventory",
        json!({"status": "success", "payload": {"reservation_id": "r-1"}}),
    );

    let (status, json) = send(&app, json_request("POST", "/events", event.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["applied"], true);
    assert_eq!(json["duplicate"], false);
    assert_eq!(json["current_step"], "ChargePayment");

    let (status, json) = send(&app, json_request("POST", "/events", event)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["duplicate"], true);
    assert_eq!(json["current_step"], "ChargePayment");

    let (_, process) = send(&app, get_request("/processes/order-1")).await;
    assert_eq!(process["data"]["reservation_id"], "r-1");
    assert_eq!(process["completed_steps"], json!(["ReserveInventory"]));
}

#[tokio::test]
async fn test_permanent_failure_compensates_without_shipping() {
    let (app, _) = setup();
    start_order(&app, "order-1").await;
    send(
        &app,
        json_request(
            "POST",
            "/events",
            reply("order-1", "ReserveInventory", json!({"status": "success"})),
        ),
    )
    .await;

    let (status, json) = send(
        &app,
        json_request(
            "POST",
            "/events",
            reply(
                "order-1",
                "ChargePayment",
                json!({"status": "failure", "error": {"kind": "permanent", "message": "card declined"}}),
            ),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "compensating");
    assert_eq!(json["current_step"], "ChargePayment");

    let mut release = reply("order-1", "ReserveInventory", json!({"status": "success"}));
    release["kind"] = json!("compensate");
    let (status, json) = send(&app, json_request("POST", "/events", release)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "compensated");

    let (_, process) = send(&app, get_request("/processes/order-1")).await;
    let steps: Vec<&str> = process["history"]
        .as_array()
        .unwrap()
        .iter()
        .map(|execution| execution["step"].as_str().unwrap())
        .collect();
    assert_eq!(steps, ["ReserveInventory", "ChargePayment"]);
}

#[tokio::test]
async fn test_stale_event_is_not_applied() {
    let (app, _) = setup();
    start_order(&app, "order-1").await;

    let (status, json) = send(
        &app,
        json_request(
            "POST",
            "/events",
            reply("order-1", "CreateShipment", json!({"status": "success"})),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["applied"], false);
    assert_eq!(json["current_step"], "ReserveInventory");
}

#[tokio::test]
async fn test_event_for_unknown_process() {
    let (app, _) = setup();

    let (status, _) = send(
        &app,
        json_request(
            "POST",
            "/events",
            reply("ghost", "ReserveInventory", json!({"status": "success"})),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_event_is_rejected() {
    let (app, _) = setup();

    let (status, _) = send(
        &app,
        json_request("POST", "/events", json!({"process_id": "order-1"})),
    )
    .await;

    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_abort_process() {
    let (app, _) = setup();
    start_order(&app, "order-1").await;

    let (status, json) = send(
        &app,
        json_request("POST", "/processes/order-1/abort", json!({"reason": "customer cancelled"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // Nothing completed yet, so there is nothing to compensate.
    assert_eq!(json["status"], "compensated");
    assert_eq!(json["history"][0]["error"], "customer cancelled");

    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/processes/order-1/abort")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_list_dead_letters() {
    let (app, store) = setup();
    for step in ["ReserveInventory", "ChargePayment"] {
        store
            .send(DeadLetterRecord::compensation(
                &ProcessId::from("order-9"),
                step,
                json!({}),
                "gave up",
                5,
            ))
            .await
            .unwrap();
    }

    let (status, json) = send(&app, get_request("/dead-letters")).await;
    assert_eq!(status, StatusCode::OK);
    let records = json.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["kind"], "compensation");
    assert_eq!(records[0]["aggregate_id"], "order-9");

    let (_, json) = send(&app, get_request("/dead-letters?limit=1")).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
}
