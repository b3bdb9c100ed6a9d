//! # Admission Configuration Module
//!
//! Configuration surface consumed when the admission layer is constructed:
//! deduplication timing and scope, the signature header allow-list, and the
//! sliding-window limits.
//!
//! ```rust
//! use floodgate::admission::config::AdmissionConfig;
//!
//! let config = AdmissionConfig::default();
//! config.validate().unwrap();
//! ```

use crate::signature::DEFAULT_MAX_SIGNATURE_BODY_BYTES;
use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default follower wait / sweep interval in seconds
pub const DEFAULT_DEDUP_TTL_SECONDS: f64 = 5.0;

/// Default number of distinct in-flight signatures
pub const DEFAULT_MAX_PENDING_SIGNATURES: usize = 1000;

/// Default grace window after a leader completes, in milliseconds
pub const DEFAULT_DEDUP_GRACE_MS: u64 = 50;

/// Upper bound on the dedup TTL, in seconds (one day)
pub const MAX_DEDUP_TTL_SECONDS: f64 = 86_400.0;

/// Upper bound on the rate limit window, in seconds (one day)
pub const MAX_WINDOW_SECONDS: u64 = 86_400;

pub const DEFAULT_REQUESTS_PER_WINDOW: u32 = 60;
pub const DEFAULT_WINDOW_SECONDS: u64 = 60;
pub const DEFAULT_MAX_TRACKED_CLIENTS: usize = 10_000;
pub const DEFAULT_CLEANUP_INTERVAL_CHECKS: u64 = 1000;

/// Complete admission layer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub dedup: DedupConfig,
    pub signature: SignatureConfig,
    pub rate_limiting: RateLimitConfig,
}

/// Deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub enabled: bool,

    /// Follower wait bound; also the sweep interval. Entries older than twice this are force-completed.
    pub ttl_seconds: f64,

    /// Distinct signatures tracked at once before new ones bypass deduplication
    pub max_pending_signatures: usize,

    /// How long a completed entry remains visible to late duplicates
    pub grace_ms: u64,

    /// When set, only paths under these prefixes are deduplicated, whatever the method
    pub enabled_path_prefixes: Option<Vec<String>>,

    /// Paths that are never deduplicated
    pub excluded_paths: Vec<String>,
}

/// Signature computation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Header names folded into the signature, case-insensitive
    pub header_allow_list: Vec<String>,

    /// Largest body buffered for signing; larger bodies degrade the signature
    pub max_body_bytes: usize,
}

/// Sliding-window rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_window: u32,
    pub window_seconds: u64,

    /// Hard cap on tracked client identifiers
    pub max_tracked_clients: usize,

    /// Run the eviction sweep once every this many checks
    pub cleanup_interval_checks: u64,

    /// Take the client identifier from the first `X-Forwarded-For` entry
    pub trust_forwarded_for: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: DEFAULT_DEDUP_TTL_SECONDS,
            max_pending_signatures: DEFAULT_MAX_PENDING_SIGNATURES,
            grace_ms: DEFAULT_DEDUP_GRACE_MS,
            enabled_path_prefixes: None,
            excluded_paths: default_excluded_paths(),
        }
    }
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            header_allow_list: vec![
                "content-type".to_string(),
                "accept".to_string(),
                "x-api-key".to_string(),
            ],
            max_body_bytes: DEFAULT_MAX_SIGNATURE_BODY_BYTES,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: DEFAULT_REQUESTS_PER_WINDOW,
            window_seconds: DEFAULT_WINDOW_SECONDS,
            max_tracked_clients: DEFAULT_MAX_TRACKED_CLIENTS,
            cleanup_interval_checks: DEFAULT_CLEANUP_INTERVAL_CHECKS,
            trust_forwarded_for: true,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs_f64(self.ttl_seconds)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

impl SignatureConfig {
    /// Parse the allow-list into header names
    pub fn header_names(&self) -> Result<Vec<HeaderName>, AdmissionConfigError> {
        self.header_allow_list
            .iter()
            .map(|name| {
                HeaderName::try_from(name.trim())
                    .map_err(|_| AdmissionConfigError::InvalidHeaderName(name.clone()))
            })
            .collect()
    }
}

impl AdmissionConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), AdmissionConfigError> {
        let ttl = self.dedup.ttl_seconds;
        if !ttl.is_finite() || ttl <= 0.0 {
            return Err(AdmissionConfigError::ValidationError(format!(
                "Dedup TTL must be a positive number of seconds, got {}",
                ttl
            )));
        }
        if ttl > MAX_DEDUP_TTL_SECONDS {
            return Err(AdmissionConfigError::ValidationError(format!(
                "Dedup TTL cannot exceed {} seconds, got {}",
                MAX_DEDUP_TTL_SECONDS, ttl
            )));
        }

        if self.dedup.max_pending_signatures == 0 {
            return Err(AdmissionConfigError::ValidationError(
                "Max pending signatures cannot be zero".to_string(),
            ));
        }

        self.signature.header_names()?;

        if self.rate_limiting.requests_per_window == 0 {
            return Err(AdmissionConfigError::ValidationError(
                "Requests per window cannot be zero".to_string(),
            ));
        }

        if self.rate_limiting.window_seconds == 0 {
            return Err(AdmissionConfigError::ValidationError(
                "Window seconds cannot be zero".to_string(),
            ));
        }
        if self.rate_limiting.window_seconds > MAX_WINDOW_SECONDS {
            return Err(AdmissionConfigError::ValidationError(format!(
                "Window seconds cannot exceed {}, got {}",
                MAX_WINDOW_SECONDS, self.rate_limiting.window_seconds
            )));
        }

        if self.rate_limiting.max_tracked_clients == 0 {
            return Err(AdmissionConfigError::ValidationError(
                "Max tracked clients cannot be zero".to_string(),
            ));
        }

        if self.rate_limiting.cleanup_interval_checks == 0 {
            return Err(AdmissionConfigError::ValidationError(
                "Cleanup interval cannot be zero".to_string(),
            ));
        }

        Ok(())
    }

    /// One-line summary for startup logs
    pub fn summary(&self) -> String {
        format!(
            "AdmissionConfig {{ \
                dedup: {}, \
                ttl: {}s, \
                max_pending: {}, \
                rate_limiting: {}, \
                limit: {}/{}s, \
                max_clients: {} \
            }}",
            self.dedup.enabled,
            self.dedup.ttl_seconds,
            self.dedup.max_pending_signatures,
            self.rate_limiting.enabled,
            self.rate_limiting.requests_per_window,
            self.rate_limiting.window_seconds,
            self.rate_limiting.max_tracked_clients
        )
    }
}

/// Health, metrics and docs endpoints
pub fn default_excluded_paths() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/metrics".to_string(),
        "/docs".to_string(),
        "/openapi.json".to_string(),
        "/admission/stats".to_string(),
    ]
}

/// Admission configuration errors
#[derive(Debug, thiserror::Error)]
pub enum AdmissionConfigError {
    #[error("Invalid header name in signature allow-list: {0}")]
    InvalidHeaderName(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
