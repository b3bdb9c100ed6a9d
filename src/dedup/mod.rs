//! # Deduplication Module
//!
//! HTTP binding of the single-flight group. Identical concurrent requests are
//! collapsed onto one downstream invocation; the first request (leader) runs the
//! handler and every duplicate (follower) receives a copy of its response.
//!
//! ## Request Flow
//!
//! 1. Eligibility: excluded paths are never deduplicated; with an inclusion list only
//!    matching prefixes are; otherwise only POST/PUT/PATCH
//! 2. Sign the request, body included whatever the method; a degraded signature
//!    skips deduplication
//! 3. Run the handler through the single-flight group keyed by signature
//! 4. The leader materialises the whole response (status, headers, body) so followers
//!    can each be handed an independent copy. Streaming responses are buffered in full
//!    before anyone sees them; that costs the leader latency on large bodies.
//!
//! ## Sweeper
//!
//! A background task wakes every TTL and force-completes entries pending longer
//! than twice the TTL, so a hung leader cannot keep followers waiting forever. On
//! shutdown it releases every pending entry with a shutdown error.

use crate::admission::config::DedupConfig;
use crate::audit::{AdmissionEvent, AuditSink};
use crate::server::shutdown::{ShutdownAwareTask, ShutdownCoordinator};
use crate::signature::{RequestSignature, SignatureComputer};
use crate::single_flight::{
    FlightError, FlightRole, SingleFlightConfig, SingleFlightGroup,
};
use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Fully buffered downstream response, shared by value with followers
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CapturedResponse {
    /// Buffer a response body so it can be replayed any number of times
    pub async fn capture(response: Response) -> Result<Self, DownstreamError> {
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| DownstreamError::Body(e.to_string()))?;

        Ok(Self {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Failure of the leader's downstream invocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownstreamError {
    #[error("failed to read downstream response body: {0}")]
    Body(String),
}

/// Collapses identical concurrent requests onto one handler invocation
#[derive(Debug)]
pub struct DeduplicationCoordinator {
    config: DedupConfig,
    signatures: SignatureComputer,
    group: SingleFlightGroup<RequestSignature, CapturedResponse, DownstreamError>,
    audit: AuditSink,
}

impl DeduplicationCoordinator {
    pub fn new(config: DedupConfig, signatures: SignatureComputer, audit: AuditSink) -> Self {
        let group = SingleFlightGroup::new(SingleFlightConfig {
            ttl: config.ttl(),
            max_pending: config.max_pending_signatures,
            grace: config.grace(),
        });

        Self {
            config,
            signatures,
            group,
            audit,
        }
    }

    /// Whether a request with this method and path takes part in deduplication
    pub fn is_eligible(&self, method: &Method, path: &str) -> bool {
        if !self.config.enabled {
            return false;
        }

        if self
            .config
            .excluded_paths
            .iter()
            .any(|excluded| path_matches(path, excluded))
        {
            return false;
        }

        match &self.config.enabled_path_prefixes {
            Some(prefixes) => prefixes.iter().any(|prefix| path_matches(path, prefix)),
            None => matches!(*method, Method::POST | Method::PUT | Method::PATCH),
        }
    }

    /// Run `handler` for `request`, or share the response of an identical request in flight
    pub async fn admit<H, Fut>(&self, client_id: &str, request: Request, handler: H) -> Response
    where
        H: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        if !self.is_eligible(request.method(), request.uri().path()) {
            return handler(request).await;
        }

        let (request, computed) = self.signatures.compute_with_body(request).await;
        if computed.degraded {
            self.audit.record_bypass();
            return handler(request).await;
        }

        let signature = computed.signature;
        let outcome = self
            .group
            .run(signature.clone(), move || async move {
                CapturedResponse::capture(handler(request).await).await
            })
            .await;

        self.report(client_id, &signature, outcome.role);

        match outcome.result {
            Ok(captured) => captured.into_response(),
            Err(e) => flight_error_response(&e),
        }
    }

    /// Force-complete entries pending longer than twice the TTL
    pub fn sweep(&self) -> usize {
        let expired = self.group.expire_stale(self.config.ttl().saturating_mul(2));
        if expired > 0 {
            info!(expired = expired, "Deduplication sweep expired stale entries");
        }
        expired
    }

    /// Release all pending entries with a shutdown error
    pub fn shutdown(&self) -> usize {
        let released = self.group.shutdown();
        info!(released = released, "Deduplication coordinator shut down");
        released
    }

    pub fn pending_count(&self) -> usize {
        self.group.pending_count()
    }

    /// Start the background sweeper; it exits and releases pending entries on shutdown
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: &ShutdownCoordinator) -> JoinHandle<()> {
        let coordinator = self.clone();
        let mut shutdown_task = ShutdownAwareTask::new(shutdown);

        tokio::spawn(async move {
            let interval = coordinator.config.ttl();
            info!(interval_ms = interval.as_millis() as u64, "Starting deduplication sweeper");
            loop {
                if shutdown_task.wait_or_shutdown(interval).await {
                    coordinator.shutdown();
                    info!("Deduplication sweeper shutting down");
                    break;
                }
                coordinator.sweep();
            }
        })
    }

    fn report(&self, client_id: &str, signature: &RequestSignature, role: FlightRole) {
        let client_id = client_id.to_string();
        let signature = signature.to_string();
        match role {
            FlightRole::Leader { waiters } => self.audit.emit(AdmissionEvent::Leader {
                client_id,
                signature,
                waiter_count: waiters,
            }),
            FlightRole::Follower => self.audit.emit(AdmissionEvent::FollowerReused {
                client_id,
                signature,
            }),
            FlightRole::FollowerFallback => {
                self.audit.emit(AdmissionEvent::FollowerTimeoutFallback {
                    client_id,
                    signature,
                })
            }
            FlightRole::Bypass => {
                debug!(client_id = %client_id, "Deduplication bypassed, registry at capacity");
                self.audit.record_bypass();
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                        Private Functions                          ****//
///////////////////////////////////////////////////////////////////////////////

/// Exact match or a match on a whole path segment prefix
fn path_matches(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn flight_error_response(error: &FlightError<DownstreamError>) -> Response {
    let (status, code) = match error {
        FlightError::Failed(DownstreamError::Body(_)) => {
            (StatusCode::BAD_GATEWAY, "UPSTREAM_BODY_ERROR")
        }
        FlightError::Expired(_) => (StatusCode::GATEWAY_TIMEOUT, "DEDUP_TIMEOUT"),
        FlightError::Shutdown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
    };

    (
        status,
        axum::Json(json!({
            "code": code,
            "message": error.to_string(),
        })),
    )
        .into_response()
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    fn coordinator(config: DedupConfig) -> (Arc<DeduplicationCoordinator>, tokio::sync::mpsc::UnboundedReceiver<AdmissionEvent>) {
        let (audit, rx) = AuditSink::channel();
        (
            Arc::new(DeduplicationCoordinator::new(
                config,
                SignatureComputer::default(),
                audit,
            )),
            rx,
        )
    }

    fn post(path: &str, body: &'static str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_default_eligibility() {
        let (coordinator, _) = coordinator(DedupConfig::default());
        assert!(coordinator.is_eligible(&Method::POST, "/v1/chat/completions"));
        assert!(coordinator.is_eligible(&Method::PUT, "/memory/store"));
        assert!(coordinator.is_eligible(&Method::PATCH, "/memory/1"));
        assert!(!coordinator.is_eligible(&Method::GET, "/v1/models"));
        assert!(!coordinator.is_eligible(&Method::DELETE, "/memory/1"));
        assert!(!coordinator.is_eligible(&Method::POST, "/health"));
        assert!(!coordinator.is_eligible(&Method::POST, "/docs/swagger"));
        assert!(coordinator.is_eligible(&Method::POST, "/healthz"));
    }

    #[test]
    fn test_inclusion_list() {
        let (coordinator, _) = coordinator(DedupConfig {
            enabled_path_prefixes: Some(vec!["/memory/".to_string()]),
            ..DedupConfig::default()
        });
        assert!(coordinator.is_eligible(&Method::POST, "/memory/search"));
        assert!(coordinator.is_eligible(&Method::GET, "/memory/search"));
        assert!(!coordinator.is_eligible(&Method::POST, "/v1/chat"));
        assert!(!coordinator.is_eligible(&Method::POST, "/memoryx"));
    }

    #[test]
    fn test_disabled() {
        let (coordinator, _) = coordinator(DedupConfig {
            enabled: false,
            ..DedupConfig::default()
        });
        assert!(!coordinator.is_eligible(&Method::POST, "/v1/chat"));
    }

    #[tokio::test]
    async fn test_followers_get_copies_of_leader_response() {
        let (coordinator, mut events) = coordinator(DedupConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..5 {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .admit(&format!("client-{}", i), post("/v1/chat", "{\"q\":1}"), |_req| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        (
                            StatusCode::CREATED,
                            [("x-backend", "llm")],
                            "completion",
                        )
                            .into_response()
                    })
                    .await
            }));
        }

        for handle in handles {
            let response = handle.await.unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
            assert_eq!(response.headers()["x-backend"], "llm");
            assert_eq!(body_string(response).await, "completion");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let AdmissionEvent::Leader { waiter_count, .. } = &event {
                assert_eq!(*waiter_count, 4);
            }
            kinds.push(event.kind());
        }
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                "follower_reused",
                "follower_reused",
                "follower_reused",
                "follower_reused",
                "leader"
            ]
        );
    }

    #[tokio::test]
    async fn test_different_bodies_are_not_merged() {
        let (coordinator, _) = coordinator(DedupConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let a = {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                coordinator
                    .admit("c", post("/v1/chat", "{\"q\":1}"), |_req| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        "one".into_response()
                    })
                    .await
            })
        };
        let b = {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                coordinator
                    .admit("c", post("/v1/chat", "{\"q\":2}"), |_req| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        "two".into_response()
                    })
                    .await
            })
        };

        assert_eq!(body_string(a.await.unwrap()).await, "one");
        assert_eq!(body_string(b.await.unwrap()).await, "two");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_receives_original_body() {
        let (coordinator, _) = coordinator(DedupConfig::default());
        let response = coordinator
            .admit("c", post("/memory/store", "{\"doc\":\"x\"}"), |req| async move {
                let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
                    .await
                    .unwrap();
                bytes.into_response()
            })
            .await;
        assert_eq!(body_string(response).await, "{\"doc\":\"x\"}");
    }

    #[tokio::test]
    async fn test_ineligible_requests_run_directly() {
        let (coordinator, mut events) = coordinator(DedupConfig::default());
        let request = Request::builder()
            .method(Method::GET)
            .uri("/v1/models")
            .body(Body::empty())
            .unwrap();

        let response = coordinator
            .admit("c", request, |_req| async { "models".into_response() })
            .await;
        assert_eq!(body_string(response).await, "models");
        assert!(events.try_recv().is_err());
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_follower_timeout_runs_handler() {
        let (coordinator, mut events) = coordinator(DedupConfig {
            ttl_seconds: 0.05,
            ..DedupConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let leader = {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                coordinator
                    .admit("leader", post("/v1/chat", "{}"), |_req| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        "slow".into_response()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower_calls = calls.clone();
        let response = coordinator
            .admit("follower", post("/v1/chat", "{}"), |_req| async move {
                follower_calls.fetch_add(1, Ordering::SeqCst);
                "fast".into_response()
            })
            .await;
        assert_eq!(body_string(response).await, "fast");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            AdmissionEvent::FollowerTimeoutFallback { ref client_id, .. } if client_id == "follower"
        ));

        assert_eq!(body_string(leader.await.unwrap()).await, "slow");
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiting_followers() {
        let (coordinator, _) = coordinator(DedupConfig {
            ttl_seconds: 30.0,
            ..DedupConfig::default()
        });

        let _leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .admit("c", post("/v1/chat", "{}"), |_req| async {
                        std::future::pending::<()>().await;
                        "never".into_response()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let follower = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .admit("c", post("/v1/chat", "{}"), |_req| async {
                        "unused".into_response()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let shutdown = ShutdownCoordinator::new();
        let sweeper = coordinator.spawn_sweeper(&shutdown);
        shutdown.initiate_shutdown();

        let response = tokio::time::timeout(Duration::from_secs(1), follower)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["code"], "SHUTTING_DOWN");

        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_expires_hung_leader() {
        let (coordinator, _) = coordinator(DedupConfig {
            ttl_seconds: 0.01,
            ..DedupConfig::default()
        });

        let _leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .admit("c", post("/v1/chat", "{}"), |_req| async {
                        std::future::pending::<()>().await;
                        "never".into_response()
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(coordinator.pending_count(), 1);
        assert_eq!(coordinator.sweep(), 1);
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_included_get_requests_with_different_bodies_are_not_merged() {
        let (coordinator, _) = coordinator(DedupConfig {
            enabled_path_prefixes: Some(vec!["/memory".to_string()]),
            ..DedupConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        let search = |body: &'static str| {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                let request = Request::builder()
                    .method(Method::GET)
                    .uri("/memory/search")
                    .body(Body::from(body))
                    .unwrap();
                coordinator
                    .admit("c", request, |req| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
                            .await
                            .unwrap();
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        bytes.into_response()
                    })
                    .await
            })
        };

        let cats = search("{\"q\":\"cats\"}");
        let dogs = search("{\"q\":\"dogs\"}");

        assert_eq!(body_string(cats.await.unwrap()).await, "{\"q\":\"cats\"}");
        assert_eq!(body_string(dogs.await.unwrap()).await, "{\"q\":\"dogs\"}");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_leader_body_failure_is_shared_as_bad_gateway() {
        let (coordinator, _) = coordinator(DedupConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .admit("c", post("/v1/embed", "{\"text\":\"x\"}"), |_req| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Response::new(Body::from_stream(futures::stream::once(async {
                            Err::<Bytes, io::Error>(io::Error::other("upstream reset"))
                        })))
                    })
                    .await
            }));
        }

        for handle in handles {
            let response = handle.await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
            let body: serde_json::Value =
                serde_json::from_str(&body_string(response).await).unwrap();
            assert_eq!(body["code"], "UPSTREAM_BODY_ERROR");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_releases_follower_with_gateway_timeout() {
        let (coordinator, _) = coordinator(DedupConfig {
            ttl_seconds: 1.0,
            ..DedupConfig::default()
        });

        let _leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .admit("leader", post("/v1/chat", "{}"), |_req| async {
                        std::future::pending::<()>().await;
                        "never".into_response()
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1500)).await;

        let follower = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .admit("follower", post("/v1/chat", "{}"), |_req| async {
                        "unused".into_response()
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(600)).await;

        assert_eq!(coordinator.sweep(), 1);
        let response = follower.await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["code"], "DEDUP_TIMEOUT");
    }

    #[test]
    fn test_path_matches() {
        assert!(path_matches("/health", "/health"));
        assert!(path_matches("/health/live", "/health"));
        assert!(path_matches("/memory/search", "/memory/"));
        assert!(!path_matches("/healthz", "/health"));
    }
}
