//! # Logging Module
//!
//! Tracing subscriber setup for the gateway.
//!
//! ## Features
//!
//! - **Level Resolution**: `FLOODGATE_LOG_LEVEL` wins over `RUST_LOG`, falling back to
//!   `floodgate=info,tower_http=debug`
//! - **Idempotent Init**: a second call (tests, embedding) leaves the existing subscriber alone

use crate::env::DEFAULT_LOG_LEVEL;
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. Returns false if one was already installed.
pub fn init_tracing(log_level: Option<&str>) -> bool {
    let filter = build_filter(log_level);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

fn build_filter(log_level: Option<&str>) -> EnvFilter {
    let directives = log_level
        .map(str::to_string)
        .or_else(|| std::env::var("FLOODGATE_LOG_LEVEL").ok())
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
}
