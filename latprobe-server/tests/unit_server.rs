use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use latprobe_common::{CreateRunResponse, ErrorResponse, Run, RunAnalytics, RunStatus, Sample};
use latprobe_server::config::{AdmissionConfig, ProbeConfig};
use latprobe_server::probe::ProbeExecutor;
use latprobe_server::store::{MemoryStore, RunStore};
use latprobe_server::{
    caller_key, handle_create_run, handle_get_analytics, handle_get_run, handle_get_run_by_slug,
    handle_health, handle_list_runs, handle_list_samples, AppState, Clock, EndpointQuery,
    ListRunsQuery, Server, ServerConfig,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// --- Test helpers ---

const NOW: u64 = 10_000;

struct MockClock(AtomicU64);

impl MockClock {
    fn new(now: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(now)))
    }
}

impl Clock for MockClock {
    fn unix_now_secs(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

fn state_with_limit(limit: u32) -> AppState {
    state_with_admission(AdmissionConfig::new(limit, Duration::from_secs(3600)))
}

fn state_with_admission(admission: AdmissionConfig) -> AppState {
    let executor = ProbeExecutor::new(&ProbeConfig {
        timeout: Duration::from_secs(5),
        follow_redirects: false,
    })
    .unwrap();
    AppState::new(
        Arc::new(MemoryStore::new()),
        executor,
        admission,
        MockClock::new(NOW) as Arc<dyn Clock>,
    )
}

fn app_state() -> AppState {
    state_with_limit(30)
}

fn peer() -> ConnectInfo<SocketAddr> {
    ConnectInfo("10.0.0.7:51000".parse().unwrap())
}

/// Consume a response body into bytes.
async fn response_body(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

async fn response_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
    serde_json::from_slice(&response_body(response).await).unwrap()
}

fn run_body(url: &str, request_count: u32) -> Bytes {
    Bytes::from(
        serde_json::json!({
            "endpoints": [{ "url": url, "method": "GET" }],
            "requestCount": request_count,
        })
        .to_string(),
    )
}

async fn create_run(state: &AppState, body: Bytes) -> Response {
    handle_create_run(State(state.clone()), peer(), HeaderMap::new(), body).await
}

/// Create a run against `url` and wait for it to finish.
async fn completed_run(state: &AppState, url: &str, request_count: u32) -> CreateRunResponse {
    let response = create_run(state, run_body(url, request_count)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: CreateRunResponse = response_json(response).await;
    state.controller.wait(created.id).await.unwrap();
    created
}

// --- health ---

#[tokio::test]
async fn test_health() {
    let response = handle_health().await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response_json(response).await;
    assert_eq!(body["status"], "ok");
}

// --- POST /runs ---

#[tokio::test]
async fn test_create_run_returns_pending_with_slug() {
    let state = app_state();
    let response = create_run(&state, run_body("http://127.0.0.1:9/", 1)).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let created: CreateRunResponse = response_json(response).await;
    assert_eq!(created.status, RunStatus::Pending);
    assert_eq!(created.slug.len(), latprobe_common::SLUG_LEN);
    assert!(state.store.get_run_by_id(created.id).unwrap().is_some());
}

#[tokio::test]
async fn test_create_run_rejects_malformed_json() {
    let state = app_state();
    let response = create_run(&state, Bytes::from_static(b"{not json")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_run_rejects_unsupported_method() {
    let state = app_state();
    let body = serde_json::json!({
        "endpoints": [{ "url": "http://a.example/", "method": "TRACE" }],
        "requestCount": 1,
    });
    let response = create_run(&state, Bytes::from(body.to_string())).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_run_rejects_invalid_parameters() {
    let state = app_state();
    for body in [
        serde_json::json!({ "endpoints": [], "requestCount": 5 }),
        serde_json::json!({ "endpoints": [{ "url": "http://a/", "method": "GET" }], "requestCount": 0 }),
        serde_json::json!({ "endpoints": [{ "url": "http://a/", "method": "GET" }], "requestCount": 201 }),
        serde_json::json!({ "endpoints": [{ "url": "ftp://a/", "method": "GET" }], "requestCount": 5 }),
    ] {
        let response = create_run(&state, Bytes::from(body.to_string())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        let err: ErrorResponse = response_json(response).await;
        assert!(err.retry_after_secs.is_none());
    }
    assert!(state.store.list_recent_runs(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_create_run_rate_limited() {
    let state = state_with_limit(2);
    for _ in 0..2 {
        let response = create_run(&state, run_body("http://127.0.0.1:9/", 1)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = create_run(&state, run_body("http://127.0.0.1:9/", 1)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3600");
    let err: ErrorResponse = response_json(response).await;
    assert_eq!(err.retry_after_secs, Some(3600));
    assert_eq!(state.store.list_recent_runs(10).unwrap().len(), 2);
}

#[tokio::test]
async fn test_invalid_requests_do_not_consume_quota() {
    let state = state_with_limit(1);
    for _ in 0..3 {
        let response = create_run(&state, Bytes::from_static(b"{}")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
    let response = create_run(&state, run_body("http://127.0.0.1:9/", 1)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_spoofed_forwarded_for_ignored_by_default() {
    let state = state_with_limit(2);
    let mut admitted = 0;
    for i in 0..10 {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", format!("1.2.3.{i}").parse().unwrap());
        let response =
            handle_create_run(State(state.clone()), peer(), headers, run_body("http://127.0.0.1:9/", 1)).await;
        if response.status() == StatusCode::CREATED {
            admitted += 1;
        } else {
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        }
    }
    assert_eq!(admitted, 2);
}

#[tokio::test]
async fn test_rate_limit_keyed_by_forwarded_caller_when_trusted() {
    let mut admission = AdmissionConfig::new(1, Duration::from_secs(3600));
    admission.trust_forwarded_for = true;
    let state = state_with_admission(admission);
    let mut first = HeaderMap::new();
    first.insert("x-forwarded-for", "203.0.113.1".parse().unwrap());
    let mut second = HeaderMap::new();
    second.insert("x-forwarded-for", "203.0.113.2, 10.0.0.1".parse().unwrap());

    for headers in [first.clone(), second] {
        let response =
            handle_create_run(State(state.clone()), peer(), headers, run_body("http://127.0.0.1:9/", 1)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    let response =
        handle_create_run(State(state.clone()), peer(), first, run_body("http://127.0.0.1:9/", 1)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[test]
fn test_caller_key() {
    let addr: SocketAddr = "192.0.2.10:4000".parse().unwrap();
    assert_eq!(caller_key(&HeaderMap::new(), addr, true), "192.0.2.10");

    let mut headers = HeaderMap::new();
    headers.insert("x-forwarded-for", " 198.51.100.4 , 10.0.0.1".parse().unwrap());
    assert_eq!(caller_key(&headers, addr, true), "198.51.100.4");
    assert_eq!(caller_key(&headers, addr, false), "192.0.2.10");

    let mut empty = HeaderMap::new();
    empty.insert("x-forwarded-for", "".parse().unwrap());
    assert_eq!(caller_key(&empty, addr, true), "192.0.2.10");
}

// --- GET /runs/:id and /r/:slug ---

#[tokio::test]
async fn test_get_run_by_id_and_slug() {
    let mut target = mockito::Server::new_async().await;
    target.mock("GET", "/ok").with_status(200).create_async().await;

    let state = app_state();
    let created = completed_run(&state, &format!("{}/ok", target.url()), 2).await;

    let response = handle_get_run(State(state.clone()), Path(created.id.to_string())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let run: Run = response_json(response).await;
    assert_eq!(run.status, RunStatus::Completed);

    let response = handle_get_run_by_slug(State(state.clone()), Path(created.slug.clone())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let run: Run = response_json(response).await;
    assert_eq!(run.id, created.id);
}

#[tokio::test]
async fn test_get_run_not_found() {
    let state = app_state();
    let response = handle_get_run(State(state.clone()), Path(Uuid::new_v4().to_string())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = handle_get_run(State(state.clone()), Path("not-a-uuid".to_string())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = handle_get_run_by_slug(State(state), Path("zzzzzzzz".to_string())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// --- GET /runs ---

#[tokio::test]
async fn test_list_runs_newest_first_and_clamped() {
    let state = app_state();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let created: CreateRunResponse =
            response_json(create_run(&state, run_body("http://127.0.0.1:9/", 1)).await).await;
        ids.push(created.id);
    }

    let response = handle_list_runs(State(state.clone()), Query(ListRunsQuery { limit: Some(2) })).await;
    let runs: Vec<Run> = response_json(response).await;
    assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![ids[2], ids[1]]);

    let response = handle_list_runs(State(state.clone()), Query(ListRunsQuery { limit: Some(0) })).await;
    let runs: Vec<Run> = response_json(response).await;
    assert_eq!(runs.len(), 1);

    let response = handle_list_runs(State(state), Query(ListRunsQuery::default())).await;
    let runs: Vec<Run> = response_json(response).await;
    assert_eq!(runs.len(), 3);
}

// --- samples / analytics ---

#[tokio::test]
async fn test_samples_and_analytics_for_completed_run() {
    let mut target = mockito::Server::new_async().await;
    target.mock("GET", "/ok").with_status(200).with_body("pong").create_async().await;

    let state = app_state();
    let url = format!("{}/ok", target.url());
    let created = completed_run(&state, &url, 4).await;

    let response = handle_list_samples(
        State(state.clone()),
        Path(created.id.to_string()),
        Query(EndpointQuery::default()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let samples: Vec<Sample> = response_json(response).await;
    assert_eq!(samples.len(), 4);
    assert!(samples.iter().all(|s| s.response_size_bytes == 4));

    let response = handle_get_analytics(
        State(state.clone()),
        Path(created.id.to_string()),
        Query(EndpointQuery::default()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let analytics: RunAnalytics = response_json(response).await;
    assert_eq!(analytics.status, RunStatus::Completed);
    assert_eq!(analytics.sample_count, 4);
    assert_eq!(analytics.summary.len(), 1);
    assert_eq!(analytics.summary[0].endpoint_url, url);
    assert_eq!(analytics.summary[0].request_count, 4);
    assert_eq!(analytics.summary[0].success_rate, 100.0);
    assert_eq!(analytics.histogram.len(), 6);
    assert!(analytics.payload_buckets.is_empty());
}

#[tokio::test]
async fn test_samples_filtered_by_endpoint_query() {
    let mut target = mockito::Server::new_async().await;
    target.mock("GET", "/a").with_status(200).create_async().await;
    target.mock("GET", "/b").with_status(500).create_async().await;

    let state = app_state();
    let a = format!("{}/a", target.url());
    let b = format!("{}/b", target.url());
    let body = serde_json::json!({
        "endpoints": [{ "url": a, "method": "GET" }, { "url": b, "method": "GET" }],
        "requestCount": 2,
    });
    let created: CreateRunResponse =
        response_json(create_run(&state, Bytes::from(body.to_string())).await).await;
    state.controller.wait(created.id).await.unwrap();

    let query = EndpointQuery { endpoint: Some(b.clone()) };
    let response = handle_get_analytics(State(state.clone()), Path(created.id.to_string()), Query(query)).await;
    let analytics: RunAnalytics = response_json(response).await;
    assert_eq!(analytics.sample_count, 2);
    assert_eq!(analytics.summary.len(), 1);
    assert_eq!(analytics.summary[0].endpoint_url, b);
    assert_eq!(analytics.summary[0].error_rate, 100.0);
}

#[tokio::test]
async fn test_samples_and_analytics_unknown_run() {
    let state = app_state();
    let id = Uuid::new_v4().to_string();
    let response =
        handle_list_samples(State(state.clone()), Path(id.clone()), Query(EndpointQuery::default())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = handle_get_analytics(State(state), Path(id), Query(EndpointQuery::default())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// --- Server ---

#[test]
fn test_server_config_defaults() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let config = ServerConfig::new(addr);
    assert!(config.database.is_none());
    assert!(!config.probe.follow_redirects);
    assert_eq!(config.probe.timeout, Duration::from_secs(30));
    assert_eq!(config.admission.limit, 30);
    assert!(!config.admission.trust_forwarded_for);
    assert_eq!(Server::new(config).address(), addr);
}

#[tokio::test]
async fn test_server_refuses_sub_second_admission_window() {
    let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
    config.admission = AdmissionConfig::new(5, Duration::from_millis(200));
    let (ready_tx, _ready_rx) = tokio::sync::oneshot::channel();
    assert!(Server::new(config).run(ready_tx).await.is_err());
}
