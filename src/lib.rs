//! # Floodgate
//!
//! Admission control for an HTTP service whose handlers are expensive (inference,
//! embedding, search). Sits in front of the handlers and decides, per request:
//!
//! - **Rate limiting**: a per-client sliding-window limiter rejects clients over
//!   budget with 429 before any work is done
//! - **Deduplication**: identical concurrent requests share one downstream
//!   invocation; duplicates receive a copy of the leader's response
//!
//! The admission layer is an axum middleware (`admission::admission_layer`) and
//! can be mounted on any router. The bundled binary forwards admitted requests
//! to a single upstream.

pub mod admission;
pub mod audit;
pub mod cli;
pub mod dedup;
pub mod env;
pub mod logging;
pub mod rate_limiter;
pub mod routing;
pub mod server;
pub mod signature;
pub mod single_flight;

#[cfg(test)]
mod test_server;
#[cfg(test)]
mod tests;

use admission::AdmissionMiddleware;

/// Shared state for the gateway router
#[derive(Clone)]
pub struct AppState {
    pub http_client: reqwest::Client,
    pub upstream_url: String,
    pub admission: AdmissionMiddleware,
}
