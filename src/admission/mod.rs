//! # Admission Module
//!
//! Composes the sliding-window limiter and the deduplication coordinator in
//! front of a downstream handler.
//!
//! ## Ordering
//!
//! 1. Resolve the client identifier (first `X-Forwarded-For` entry, else peer address)
//! 2. Rate limit. A rejected request is answered with 429 and never reaches deduplication
//! 3. Deduplicate eligible requests, otherwise call the handler directly
//! 4. Attach `X-RateLimit-*` headers to whatever response comes back
//!
//! Rate limiting counts every request, including ones later coalesced onto a
//! leader, so a client cannot exceed its budget by sending duplicates.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use axum::{Router, middleware, routing::post};
//! use floodgate::admission::{AdmissionMiddleware, admission_layer, config::AdmissionConfig};
//! use floodgate::audit::AuditSink;
//!
//! let admission = AdmissionMiddleware::new(AdmissionConfig::default(), AuditSink::new()).unwrap();
//! let app: Router = Router::new()
//!     .route("/v1/chat", post(|| async { "ok" }))
//!     .layer(middleware::from_fn_with_state(admission, admission_layer));
//! ```

pub mod config;

use crate::audit::{AdmissionEvent, AdmissionStatsSnapshot, AuditSink};
use crate::dedup::DeduplicationCoordinator;
use crate::rate_limiter::{SlidingWindowLimiter, resolve_client_id};
use crate::server::shutdown::ShutdownCoordinator;
use crate::signature::SignatureComputer;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use config::{AdmissionConfig, AdmissionConfigError};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Rate limiting and deduplication in front of a handler. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AdmissionMiddleware {
    config: Arc<AdmissionConfig>,
    limiter: Arc<SlidingWindowLimiter>,
    dedup: Arc<DeduplicationCoordinator>,
    audit: AuditSink,
}

impl AdmissionMiddleware {
    pub fn new(config: AdmissionConfig, audit: AuditSink) -> Result<Self, AdmissionConfigError> {
        config.validate()?;

        let signatures = SignatureComputer::new(
            config.signature.header_names()?,
            config.signature.max_body_bytes,
        );
        let limiter = SlidingWindowLimiter::new(config.rate_limiting.clone());
        let dedup = DeduplicationCoordinator::new(config.dedup.clone(), signatures, audit.clone());

        info!("Admission layer configured: {}", config.summary());

        Ok(Self {
            config: Arc::new(config),
            limiter: Arc::new(limiter),
            dedup: Arc::new(dedup),
            audit,
        })
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    /// Admit `request` from `peer` and run `handler` if it passes
    pub async fn handle<H, Fut>(&self, peer: Option<IpAddr>, request: Request, handler: H) -> Response
    where
        H: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let client_id = resolve_client_id(
            request.headers(),
            peer,
            self.config.rate_limiting.trust_forwarded_for,
        );

        let decision = if self.config.rate_limiting.enabled {
            let decision = self.limiter.check(&client_id);
            if !decision.allowed {
                self.audit.emit(AdmissionEvent::RateLimited {
                    client_id,
                    path: request.uri().path().to_string(),
                    retry_after_secs: decision.retry_after_secs.unwrap_or(1),
                });
                return decision.rejection_response();
            }
            Some(decision)
        } else {
            None
        };

        self.audit.record_allowed();
        let mut response = self.dedup.admit(&client_id, request, handler).await;

        if let Some(decision) = decision {
            decision.apply_headers(response.headers_mut());
        }
        response
    }

    pub fn stats(&self) -> AdmissionStatsSnapshot {
        self.audit
            .snapshot(self.dedup.pending_count(), self.limiter.tracked_clients())
    }

    pub fn spawn_sweeper(&self, shutdown: &ShutdownCoordinator) -> JoinHandle<()> {
        self.dedup.spawn_sweeper(shutdown)
    }

    /// Release every pending deduplication entry
    pub fn shutdown(&self) -> usize {
        self.dedup.shutdown()
    }
}

/// Axum middleware entry point, use with `middleware::from_fn_with_state`
pub async fn admission_layer(
    State(admission): State<AdmissionMiddleware>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    admission
        .handle(peer, request, move |request| next.run(request))
        .await
}
