//! # Router Module
//!
//! Builds the gateway router.
//!
//! ## Architecture
//!
//! The router is layered:
//! 1. Local routes (`/health`, `/admission/stats`)
//! 2. Catch-all forwarding route for every method
//! 3. Admission middleware (rate limiting, then deduplication)
//! 4. HTTP tracing middleware
//!
//! Local routes sit behind the admission layer too; they are rate limited but
//! excluded from deduplication by the default excluded paths.

use super::handlers::{admission_stats, forward_request, health};
use crate::AppState;
use crate::admission::admission_layer;
use axum::{
    Router, middleware,
    routing::{any, get},
};
use tower_http::trace::TraceLayer;

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admission/stats", get(admission_stats))
        .route("/", any(forward_request))
        .route("/{*path}", any(forward_request))
        .layer(middleware::from_fn_with_state(
            state.admission.clone(),
            admission_layer,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
// Tests for the router are in the tests module
