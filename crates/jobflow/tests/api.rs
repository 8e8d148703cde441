mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{harness, Scripted, JOB_TYPE};
use jobflow::api::{router, ApiState, WORKER_ID_HEADER, WORKER_TOKEN_HEADER};
use jobflow::config::JobDefaults;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> Router {
    let h = harness(Scripted::new(), 2);
    router(ApiState {
        manager: Arc::new(h.manager),
        defaults: JobDefaults::default(),
    })
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn as_worker(mut req: Request<Body>, worker_id: &str, token: &str) -> Request<Body> {
    let headers = req.headers_mut();
    headers.insert(WORKER_ID_HEADER, worker_id.parse().unwrap());
    headers.insert(WORKER_TOKEN_HEADER, token.parse().unwrap());
    req
}

async fn create_pull_job(app: &Router, n: usize) -> String {
    let items: Vec<Value> = (0..n).map(|i| json!({ "step": i })).collect();
    let (status, body) = send(
        app,
        post_json(
            "/jobs",
            json!({ "job_type": "train_step", "items": items, "topology": "pull" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["topology"], "pull");
    body["job_id"].as_str().unwrap().to_string()
}

async fn register(app: &Router, worker_id: &str, token: &str) {
    let (status, body) = send(
        app,
        post_json("/workers", json!({ "worker_id": worker_id, "token": token })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], worker_id);
    assert!(body.get("credential_hash").is_none());
}

#[tokio::test]
async fn create_then_read_status() {
    let app = app();
    let (status, body) = send(
        &app,
        post_json(
            "/jobs",
            json!({ "job_type": JOB_TYPE, "items": [{ "doc": 1 }, { "doc": 2 }] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["total_items"], 2);
    assert_eq!(body["topology"], "in_process");

    let id = body["job_id"].as_str().unwrap();
    let (status, view) = send(&app, get(&format!("/jobs/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["id"], id);
    assert_eq!(view["total_items"], 2);
    assert_eq!(view["is_stuck"], false);
    assert_eq!(view["ready_to_finalize"], false);
    assert!(view["heartbeat_age_secs"].is_i64());

    let (status, errors) = send(&app, get(&format!("/jobs/{id}/errors"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(errors.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_job_is_404() {
    let app = app();
    let (status, body) = send(
        &app,
        get("/jobs/00000000-0000-0000-0000-000000000000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn bad_requests_are_400() {
    let app = app();
    let (status, _) = send(&app, get("/jobs?status=sideways")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json("/jobs", json!({ "job_type": " ", "items": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn illegal_recovery_is_409() {
    let app = app();
    let id = create_pull_job(&app, 1).await;

    // nobody claimed it; still PENDING
    let (status, _) = send(&app, post_json(&format!("/jobs/{id}/resume"), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, post_json(&format!("/jobs/{id}/archive"), json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, post_json(&format!("/jobs/{id}/cancel"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    let (status, _) = send(
        &app,
        post_json(&format!("/jobs/{id}/reprocess"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&app, post_json(&format!("/jobs/{id}/archive"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["archived_at"].is_string());
}

#[tokio::test]
async fn worker_routes_require_credentials() {
    let app = app();
    let (status, _) = send(&app, post_json("/workers/claim", json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    register(&app, "gpu-0", "token-secret").await;
    let (status, _) = send(
        &app,
        as_worker(post_json("/workers/claim", json!({})), "gpu-0", "wrong-token"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        as_worker(post_json("/workers/claim", json!({})), "gpu-0", "token-secret"),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (status, body) = send(&app, post_json("/workers/gpu-0/deactivate", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], false);

    let (status, _) = send(
        &app,
        as_worker(post_json("/workers/claim", json!({})), "gpu-0", "token-secret"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn pull_worker_claims_reports_and_completes() {
    let app = app();
    let id = create_pull_job(&app, 3).await;
    register(&app, "gpu-0", "token-secret").await;

    let (status, claimed) = send(
        &app,
        as_worker(post_json("/workers/claim", json!({})), "gpu-0", "token-secret"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["job"]["id"], id.as_str());
    assert_eq!(claimed["job"]["claimed_by"], "gpu-0");
    let items = claimed["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);

    // a bare heartbeat is just liveness
    let bare = Request::post(format!("/jobs/{id}/heartbeat"))
        .body(Body::empty())
        .unwrap();
    let (status, ack) = send(&app, as_worker(bare, "gpu-0", "token-secret")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["directive"], "continue");
    assert_eq!(ack["applied"], 0);

    let reports = json!({
        "reports": [
            { "item_id": items[0]["id"], "outcome": { "kind": "done", "output": { "loss": 0.5 } } },
            { "item_id": items[1]["id"], "outcome": { "kind": "skipped", "reason": "cached" } },
        ]
    });
    let (status, ack) = send(
        &app,
        as_worker(
            post_json(&format!("/jobs/{id}/heartbeat"), reports),
            "gpu-0",
            "token-secret",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["applied"], 2);
    assert_eq!(ack["job"]["completed_count"], 1);
    assert_eq!(ack["job"]["skipped_count"], 1);

    let (status, ack) = send(
        &app,
        as_worker(
            post_json(&format!("/jobs/{id}/complete"), json!({ "kind": "succeeded" })),
            "gpu-0",
            "token-secret",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["accepted"], true);
    assert_eq!(ack["job"]["status"], "completed");
    assert_eq!(ack["job"]["completed_count"], 2);
    assert_eq!(ack["job"]["claimed_by"], Value::Null);

    let (_, view) = send(&app, get(&format!("/jobs/{id}"))).await;
    assert_eq!(view["status"], "completed");
    assert_eq!(view["processed"], 3);

    let (status, list) = send(&app, get("/jobs?status=completed")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn sweep_metrics_and_health() {
    let app = app();
    create_pull_job(&app, 1).await;

    let (status, report) = send(&app, post_json("/watchdog/sweep", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["threshold_secs"], 300);
    assert!(report["stuck"].as_array().unwrap().is_empty());

    let (status, body) = send(&app, get("/metrics/prom")).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("# TYPE jobflow_jobs gauge"));
    assert!(text.contains("jobflow_jobs{status=\"pending\"} 1"));
    assert!(text.contains("jobflow_jobs{status=\"stuck\"} 0"));

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");
}
