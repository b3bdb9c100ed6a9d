//! # Rate Limiter Module
//!
//! Per-client sliding-window rate limiting with bounded memory.
//!
//! ## Features
//!
//! - **Sliding Window**: Uses actual request timestamps rather than fixed time buckets
//! - **Per-client Limiting**: Keyed by the first trusted `X-Forwarded-For` address or the peer address
//! - **Bounded Memory**: Stale windows are swept periodically and the number of tracked
//!   clients is capped, evicting the least recently active first
//! - **Client Hints**: Every decision carries limit/remaining/reset values for response headers
//!
//! ## Rate Limiting Strategy
//!
//! - Each check drops timestamps older than the window, then admits the request if fewer
//!   than `requests_per_window` remain
//! - Rejected requests are not recorded, so a client that keeps hammering is not pushed further out.
//!   `remaining` and the reset time therefore reflect admitted requests only: a rejected
//!   client sees `remaining = 0` and a reset at the moment its oldest admitted request expires
//! - The sweep runs every `cleanup_interval_checks` checks rather than on every check
//!
//! ## Thread Safety
//!
//! All client windows live in one map behind a single mutex. A check never waits on
//! anything but that mutex; rejection is computed synchronously.

use crate::admission::config::RateLimitConfig;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const UNKNOWN_CLIENT: &str = "unknown";

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// When the oldest request in the window falls out of it
    pub reset_at: Instant,
    /// `reset_at` as Unix seconds, for the reset header
    pub reset_epoch_secs: i64,
    /// Whole seconds to wait before retrying, at least 1. Only set on rejection.
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    /// Attach the limit/remaining/reset headers
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_epoch_secs));
        if let Some(retry_after) = self.retry_after_secs {
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
    }

    /// 429 response with a structured retry hint
    pub fn rejection_response(&self) -> Response {
        let body = RateLimitBody {
            code: "RATE_LIMIT_EXCEEDED",
            retry_after: self.retry_after_secs.unwrap_or(1),
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
        self.apply_headers(response.headers_mut());
        response
    }
}

#[derive(Debug, Serialize)]
struct RateLimitBody {
    code: &'static str,
    retry_after: u64,
}

/// Request timestamps for one client
#[derive(Debug)]
struct ClientWindow {
    timestamps: VecDeque<Instant>,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct LimiterState {
    windows: HashMap<String, ClientWindow>,
    checks_since_sweep: u64,
}

/// Sliding-window limiter keyed by client identifier
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Check and record a request for `client_id`
    pub fn check(&self, client_id: &str) -> RateLimitDecision {
        let now = Instant::now();
        let window = self.config.window();
        let limit = self.config.requests_per_window;

        let mut state = self.state.lock();

        state.checks_since_sweep += 1;
        if state.checks_since_sweep >= self.config.cleanup_interval_checks {
            state.checks_since_sweep = 0;
            sweep_locked(&mut state, now, window, self.config.max_tracked_clients);
        }

        let client = state
            .windows
            .entry(client_id.to_string())
            .or_insert_with(|| ClientWindow {
                timestamps: VecDeque::new(),
                last_seen: now,
            });
        client.last_seen = now;

        // Remove requests that slid out of the window
        while let Some(&oldest) = client.timestamps.front() {
            if now.duration_since(oldest) >= window {
                client.timestamps.pop_front();
            } else {
                break;
            }
        }

        let allowed = client.timestamps.len() < limit as usize;
        if allowed {
            client.timestamps.push_back(now);
        }

        let count = client.timestamps.len() as u32;
        let reset_after = client
            .timestamps
            .front()
            .map(|&oldest| window.saturating_sub(now.duration_since(oldest)))
            .unwrap_or(window);
        let reset_at = now.checked_add(reset_after).unwrap_or(now);

        let retry_after_secs = if allowed {
            None
        } else {
            Some(ceil_secs(reset_after).max(1))
        };

        if !allowed {
            debug!(
                client_id = %client_id,
                limit = limit,
                window_seconds = self.config.window_seconds,
                "Rate limit exceeded"
            );
        }

        RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
            reset_epoch_secs: Utc::now().timestamp() + ceil_secs(reset_after) as i64,
            retry_after_secs,
        }
    }

    /// Run the eviction sweep now. Returns the number of windows removed.
    pub fn sweep(&self) -> usize {
        let mut state = self.state.lock();
        state.checks_since_sweep = 0;
        sweep_locked(
            &mut state,
            Instant::now(),
            self.config.window(),
            self.config.max_tracked_clients,
        )
    }

    pub fn tracked_clients(&self) -> usize {
        self.state.lock().windows.len()
    }

    pub fn is_tracked(&self, client_id: &str) -> bool {
        self.state.lock().windows.contains_key(client_id)
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Resolve the identifier a request is limited under.
///
/// Uses the first address in `X-Forwarded-For` when trusted and well-formed,
/// otherwise the direct peer address.
pub fn resolve_client_id(headers: &HeaderMap, peer: Option<IpAddr>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|chain| chain.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

///////////////////////////////////////////////////////////////////////////////
//****                        Private Functions                          ****//
///////////////////////////////////////////////////////////////////////////////

fn sweep_locked(state: &mut LimiterState, now: Instant, window: Duration, max_clients: usize) -> usize {
    let before = state.windows.len();

    let stale_after = window.saturating_mul(2);
    state
        .windows
        .retain(|_, client| now.duration_since(client.last_seen) < stale_after);

    if state.windows.len() > max_clients {
        let mut by_recency: Vec<(Instant, String)> = state
            .windows
            .iter()
            .map(|(id, client)| (client.last_seen, id.clone()))
            .collect();
        by_recency.sort_unstable();

        let excess = state.windows.len() - max_clients;
        for (_, id) in by_recency.into_iter().take(excess) {
            state.windows.remove(&id);
        }
    }

    let removed = before - state.windows.len();
    if removed > 0 {
        info!(
            removed = removed,
            tracked = state.windows.len(),
            "Rate limiter sweep evicted client windows"
        );
    }
    removed
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 { secs + 1 } else { secs }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
