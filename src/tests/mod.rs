//! Router-level tests: admission layer in front of a real in-process upstream
use crate::AppState;
use crate::admission::AdmissionMiddleware;
use crate::admission::config::AdmissionConfig;
use crate::audit::AuditSink;
use crate::routing::client::create_upstream_client;
use crate::routing::router::create_router;
use crate::server::serve;
use crate::server::shutdown::ShutdownCoordinator;
use crate::test_server::{TestUpstream, spawn_test_server};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use serde_json::Value;
use tokio::time::Duration;
use tower::ServiceExt;

fn app_with(upstream_url: String, config: AdmissionConfig) -> (Router, AdmissionMiddleware) {
    let admission = AdmissionMiddleware::new(config, AuditSink::new()).unwrap();
    let state = AppState {
        http_client: create_upstream_client().unwrap(),
        upstream_url,
        admission: admission.clone(),
    };
    (create_router(state), admission)
}

async fn app(delay: Duration, config: AdmissionConfig) -> (Router, AdmissionMiddleware, TestUpstream) {
    let (upstream, shutdown_tx) = spawn_test_server(delay).await;
    // Keep the upstream alive for the whole test
    std::mem::forget(shutdown_tx);
    let (router, admission) = app_with(upstream.url(), config);
    (router, admission, upstream)
}

fn post(path: &str, client: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("x-forwarded-for", client)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str, client: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("x-forwarded-for", client)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_served_locally_with_rate_limit_headers() {
    let (router, _, upstream) = app(Duration::ZERO, AdmissionConfig::default()).await;

    let response = router.oneshot(get("/health", "10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-limit"], "60");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "59");
    assert!(response.headers().contains_key("x-ratelimit-reset"));
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn forwards_method_path_query_and_body() {
    let (router, _, upstream) = app(Duration::ZERO, AdmissionConfig::default()).await;

    let response = router
        .oneshot(post("/v1/embed?model=small", "10.0.0.1", "{\"text\":\"hi\"}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["method"], "POST");
    assert_eq!(body["uri"], "/v1/embed?model=small");
    assert_eq!(body["body"], "{\"text\":\"hi\"}");
    assert!(body["request_id"].is_string());
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test]
async fn identical_concurrent_posts_reach_upstream_once() {
    let (router, admission, upstream) =
        app(Duration::from_millis(200), AdmissionConfig::default()).await;

    let mut handles = Vec::new();
    for i in 0..5 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            router
                .oneshot(post("/v1/chat", &format!("10.0.0.{}", i + 1), "{\"prompt\":\"same\"}"))
                .await
                .unwrap()
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // Every client still gets its own rate-limit accounting
        assert_eq!(response.headers()["x-ratelimit-remaining"], "59");
        let body = json_body(response).await;
        assert_eq!(body["hit"], 1);
    }
    assert_eq!(upstream.hits(), 1);

    let stats = admission.stats();
    assert_eq!(stats.leaders, 1);
    assert_eq!(stats.followers_reused, 4);
    assert_eq!(stats.allowed, 5);
}

#[tokio::test]
async fn different_bodies_are_forwarded_separately() {
    let (router, _, upstream) = app(Duration::from_millis(100), AdmissionConfig::default()).await;

    let a = tokio::spawn(router.clone().oneshot(post("/v1/chat", "10.0.0.1", "{\"prompt\":\"a\"}")));
    let b = tokio::spawn(router.clone().oneshot(post("/v1/chat", "10.0.0.1", "{\"prompt\":\"b\"}")));

    let a = json_body(a.await.unwrap().unwrap()).await;
    let b = json_body(b.await.unwrap().unwrap()).await;
    assert_eq!(a["body"], "{\"prompt\":\"a\"}");
    assert_eq!(b["body"], "{\"prompt\":\"b\"}");
    assert_eq!(upstream.hits(), 2);
}

#[tokio::test]
async fn concurrent_gets_are_not_deduplicated() {
    let (router, _, upstream) = app(Duration::from_millis(100), AdmissionConfig::default()).await;

    let a = tokio::spawn(router.clone().oneshot(get("/v1/models", "10.0.0.1")));
    let b = tokio::spawn(router.clone().oneshot(get("/v1/models", "10.0.0.1")));
    assert_eq!(a.await.unwrap().unwrap().status(), StatusCode::OK);
    assert_eq!(b.await.unwrap().unwrap().status(), StatusCode::OK);
    assert_eq!(upstream.hits(), 2);
}

#[tokio::test]
async fn rate_limit_is_per_client() {
    let mut config = AdmissionConfig::default();
    config.rate_limiting.requests_per_window = 2;
    let (router, admission, upstream) = app(Duration::ZERO, config).await;

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(get("/v1/models", "203.0.113.7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let rejected = router
        .clone()
        .oneshot(get("/v1/models", "203.0.113.7, 10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(rejected.headers()["x-ratelimit-remaining"], "0");
    let retry_after: u64 = rejected.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    let body = json_body(rejected).await;
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["retry_after"], retry_after);

    let other = router
        .clone()
        .oneshot(get("/v1/models", "198.51.100.2"))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);

    assert_eq!(upstream.hits(), 3);
    assert_eq!(admission.stats().rate_limited, 1);
    assert_eq!(admission.stats().tracked_clients, 2);
}

#[tokio::test]
async fn stats_endpoint_reports_counters() {
    let (router, _, _) = app(Duration::ZERO, AdmissionConfig::default()).await;

    router
        .clone()
        .oneshot(post("/v1/chat", "10.0.0.1", "{}"))
        .await
        .unwrap();
    let response = router
        .oneshot(get("/admission/stats", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stats = json_body(response).await;
    assert_eq!(stats["leaders"], 1);
    assert_eq!(stats["allowed"], 2);
    assert_eq!(stats["tracked_clients"], 1);
}

#[tokio::test]
async fn unreachable_upstream_returns_bad_gateway() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let (router, _) = app_with(dead, AdmissionConfig::default());
    let response = router
        .oneshot(post("/v1/chat", "10.0.0.1", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(json_body(response).await["code"], "UPSTREAM_UNAVAILABLE");
}

#[tokio::test]
async fn serve_uses_peer_address_and_shuts_down() {
    let (upstream, _upstream_shutdown) = spawn_test_server(Duration::ZERO).await;
    let mut config = AdmissionConfig::default();
    config.rate_limiting.trust_forwarded_for = false;
    let admission = AdmissionMiddleware::new(config, AuditSink::new()).unwrap();
    let state = AppState {
        http_client: create_upstream_client().unwrap(),
        upstream_url: upstream.url(),
        admission: admission.clone(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = ShutdownCoordinator::new();
    let server = tokio::spawn(serve(listener, state, shutdown.clone()));

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/chat", addr))
        .header("x-forwarded-for", "203.0.113.7")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(admission.limiter().is_tracked("127.0.0.1"));
    assert!(!admission.limiter().is_tracked("203.0.113.7"));

    shutdown.initiate_shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
