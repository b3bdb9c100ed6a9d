use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, Uri};
use axum::{Json, Router, routing::any};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;
use tokio::time::Duration;

/// Upstream stand-in that counts hits and echoes what it received
#[derive(Clone)]
pub struct TestUpstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl TestUpstream {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct UpstreamState {
    hits: Arc<AtomicUsize>,
    delay: Duration,
}

async fn echo(
    State(state): State<UpstreamState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(state.delay).await;

    Json(json!({
        "hit": hit,
        "method": method.as_str(),
        "uri": uri.to_string(),
        "request_id": headers.get("x-request-id").and_then(|v| v.to_str().ok()),
        "body": String::from_utf8_lossy(&body),
    }))
}

/// Spawn an upstream that answers every path after `delay`
pub async fn spawn_test_server(delay: Duration) -> (TestUpstream, oneshot::Sender<()>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/", any(echo))
        .route("/{*path}", any(echo))
        .with_state(UpstreamState {
            hits: hits.clone(),
            delay,
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .await
            .unwrap();
    });
    (TestUpstream { addr, hits }, tx)
}
