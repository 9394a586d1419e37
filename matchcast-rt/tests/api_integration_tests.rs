//! Integration tests for matchcast-rt HTTP endpoints and the update flow

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use matchcast_common::db::{init_memory_database, SqliteRecordStore};
use matchcast_common::events::{LiveEvent, ScoreResult};
use matchcast_common::Topic;
use matchcast_rt::channel::ConnectionHandle;
use matchcast_rt::scheduler::{CalendarSchedule, MaintenanceScheduler, RetrainJob};
use matchcast_rt::scorer::{ComputationError, OutcomeKind, ScorerRunner};
use matchcast_rt::AppState;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tower::util::ServiceExt;

/// Scorer stand-in: counts calls, optionally waits for release
struct TestRunner {
    calls: AtomicUsize,
    gate: Option<Notify>,
}

impl TestRunner {
    fn immediate() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            gate: None,
        })
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            gate: Some(Notify::new()),
        })
    }
}

#[async_trait]
impl ScorerRunner for TestRunner {
    async fn score(&self, _topic: &Topic) -> Result<ScoreResult, ComputationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(ScoreResult::new("home", 0.8))
    }
}

fn idle_scheduler() -> Option<Arc<MaintenanceScheduler>> {
    Some(MaintenanceScheduler::new(
        CalendarSchedule::parse("0 0 * * *").unwrap(),
        RetrainJob::new("true", vec![]),
    ))
}

/// Test helper: app state with in-memory database
async fn create_test_state(
    runner: Arc<TestRunner>,
    scheduler: Option<Arc<MaintenanceScheduler>>,
) -> AppState {
    let pool = init_memory_database()
        .await
        .expect("Failed to create in-memory database");

    AppState::new(
        Arc::new(SqliteRecordStore::new(pool)),
        runner,
        Duration::from_secs(5),
        scheduler,
        16,
    )
}

fn topic(s: &str) -> Topic {
    Topic::parse(s).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

async fn recv_event(rx: &mut tokio::sync::mpsc::Receiver<Arc<LiveEvent>>) -> Arc<LiveEvent> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within timeout")
        .expect("connection open")
}

#[tokio::test]
async fn test_health_endpoint() {
    let state = create_test_state(TestRunner::immediate(), idle_scheduler()).await;
    let app = matchcast_rt::build_router(state);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "matchcast-rt");
    assert_eq!(json["topics"], 0);
    assert_eq!(json["scorer"]["started"], 0);
    assert_eq!(json["maintenance"]["schedule"], "0 0 * * *");
    assert_eq!(json["maintenance"]["running"], false);
}

#[tokio::test]
async fn test_post_update_created_then_modified() {
    let state = create_test_state(TestRunner::immediate(), idle_scheduler()).await;
    let app = matchcast_rt::build_router(state);

    let first = app
        .clone()
        .oneshot(post_json("/api/topics/M1/updates", r#"{"status":"live"}"#))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let first = body_json(first).await;
    assert_eq!(first["created"], true);
    assert_eq!(first["revision"], 1);
    assert_eq!(first["scoring"], "started");

    let second = app
        .oneshot(post_json("/api/topics/M1/updates", r#"{"score":"1-0"}"#))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second = body_json(second).await;
    assert_eq!(second["created"], false);
    assert_eq!(second["revision"], 2);
    assert_eq!(second["scoring"], "not_requested");
}

#[tokio::test]
async fn test_post_update_rejects_bad_input() {
    let state = create_test_state(TestRunner::immediate(), idle_scheduler()).await;
    let app = matchcast_rt::build_router(state);

    let blank_topic = app
        .clone()
        .oneshot(post_json("/api/topics/%20%20/updates", r#"{"status":"live"}"#))
        .await
        .unwrap();
    assert_eq!(blank_topic.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(blank_topic).await["error"]["code"], "BAD_REQUEST");

    let not_object = app
        .clone()
        .oneshot(post_json("/api/topics/M1/updates", "[1, 2]"))
        .await
        .unwrap();
    assert_eq!(not_object.status(), StatusCode::BAD_REQUEST);

    let malformed = app
        .oneshot(post_json("/api/topics/M1/updates", "{nope"))
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(malformed).await["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_subscriber_gets_update_then_score_result() {
    let state = create_test_state(TestRunner::immediate(), idle_scheduler()).await;
    let (handle, mut rx) = ConnectionHandle::channel(16);
    state.registry.subscribe(&topic("M1"), &handle);

    let outcome = state
        .ingestor
        .ingest(&topic("M1"), json!({"status": "live"}))
        .await
        .unwrap();
    assert!(outcome.created);

    match recv_event(&mut rx).await.as_ref() {
        LiveEvent::Update { topic: t, payload, .. } => {
            assert_eq!(t, &topic("M1"));
            assert_eq!(payload, &json!({"status": "live"}));
        }
        other => panic!("expected update, got {:?}", other),
    }

    match recv_event(&mut rx).await.as_ref() {
        LiveEvent::ScoreResult { result, .. } => {
            assert_eq!(result.outcome, "home");
            assert_eq!(result.confidence, 0.8);
        }
        other => panic!("expected scoreResult, got {:?}", other),
    }
}

#[tokio::test]
async fn test_two_ingests_during_scoring_launch_one_computation() {
    let runner = TestRunner::gated();
    let state = create_test_state(runner.clone(), idle_scheduler()).await;
    let mut reports = state.scorer.subscribe_reports();
    let (handle, mut rx) = ConnectionHandle::channel(16);
    state.registry.subscribe(&topic("M1"), &handle);

    state
        .ingestor
        .ingest(&topic("M1"), json!({"minute": 1}))
        .await
        .unwrap();
    state
        .ingestor
        .ingest(&topic("M1"), json!({"minute": 2}))
        .await
        .unwrap();

    for expected in [1, 2] {
        match recv_event(&mut rx).await.as_ref() {
            LiveEvent::Update { payload, .. } => assert_eq!(payload["minute"], expected),
            other => panic!("expected update, got {:?}", other),
        }
    }

    while runner.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    if let Some(gate) = &runner.gate {
        gate.notify_one();
    }

    let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, OutcomeKind::Succeeded);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        recv_event(&mut rx).await.as_ref(),
        LiveEvent::ScoreResult { .. }
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_manual_maintenance_run_and_overlap() {
    let scheduler = MaintenanceScheduler::new(
        CalendarSchedule::parse("0 0 * * *").unwrap(),
        RetrainJob::new("sh", vec!["-c".to_string(), "sleep 2".to_string()]),
    );
    let state = create_test_state(TestRunner::immediate(), Some(scheduler)).await;
    let app = matchcast_rt::build_router(state);

    let first = app
        .clone()
        .oneshot(post_json("/api/maintenance/run", ""))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(first).await["outcome"], "started");

    let second = app
        .clone()
        .oneshot(post_json("/api/maintenance/run", ""))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(second).await["error"]["code"], "CONFLICT");

    let status = app
        .oneshot(
            Request::builder()
                .uri("/api/maintenance")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = body_json(status).await;
    assert_eq!(status["running"], true);
    assert_eq!(status["skipped"], 1);
}

#[tokio::test]
async fn test_maintenance_endpoints_absent_when_disabled() {
    let state = create_test_state(TestRunner::immediate(), None).await;
    let app = matchcast_rt::build_router(state);

    let run = app
        .clone()
        .oneshot(post_json("/api/maintenance/run", ""))
        .await
        .unwrap();
    assert_eq!(run.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(run).await["error"]["code"], "NOT_FOUND");

    let status = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/maintenance")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(status.status(), StatusCode::NOT_FOUND);

    let health = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert!(body_json(health).await["maintenance"].is_null());
}
