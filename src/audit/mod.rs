//! # Audit Module
//!
//! Boundary to the audit/metrics collaborator. The admission layer reports one
//! discrete event per decision that matters to an operator:
//!
//! - `leader`: a request ran the downstream handler and served `waiter_count` followers
//! - `follower_reused`: a request reused a leader's response
//! - `follower_timeout_fallback`: a follower gave up waiting and ran the handler itself
//! - `rate_limited`: a request was rejected with 429
//!
//! Emission is fire-and-forget. A custom handler is invoked synchronously and
//! must not block; a panicking handler is contained and logged. Counters are
//! kept alongside so the stats endpoint can report totals without a sink.

use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

///////////////////////////////////////////////////////////////////////////////
//****                         Public Types                              ****//
///////////////////////////////////////////////////////////////////////////////

/// Admission decision worth reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdmissionEvent {
    Leader {
        client_id: String,
        signature: String,
        waiter_count: u64,
    },
    FollowerReused {
        client_id: String,
        signature: String,
    },
    FollowerTimeoutFallback {
        client_id: String,
        signature: String,
    },
    RateLimited {
        client_id: String,
        path: String,
        retry_after_secs: u64,
    },
}

impl AdmissionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionEvent::Leader { .. } => "leader",
            AdmissionEvent::FollowerReused { .. } => "follower_reused",
            AdmissionEvent::FollowerTimeoutFallback { .. } => "follower_timeout_fallback",
            AdmissionEvent::RateLimited { .. } => "rate_limited",
        }
    }
}

type EventHandler = Arc<dyn Fn(&AdmissionEvent) + Send + Sync>;

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Running totals for the admission layer
#[derive(Debug, Default)]
pub struct AdmissionStats {
    pub allowed: AtomicU64,
    pub rate_limited: AtomicU64,
    pub leaders: AtomicU64,
    pub followers_reused: AtomicU64,
    pub follower_fallbacks: AtomicU64,
    pub dedup_bypassed: AtomicU64,
}

/// Point-in-time copy of the counters plus registry sizes
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AdmissionStatsSnapshot {
    pub allowed: u64,
    pub rate_limited: u64,
    pub leaders: u64,
    pub followers_reused: u64,
    pub follower_fallbacks: u64,
    pub dedup_bypassed: u64,
    pub pending_signatures: usize,
    pub tracked_clients: usize,
}

/// Fire-and-forget event sink shared by the limiter and the coordinator
#[derive(Clone, Default)]
pub struct AuditSink {
    handler: Option<EventHandler>,
    stats: Arc<AdmissionStats>,
}

impl AuditSink {
    /// Sink that only logs and counts
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a custom event handler
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&AdmissionEvent) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Sink that forwards every event into an unbounded channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AdmissionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self::new().with_handler(move |event| {
            // Receiver gone means nobody is listening any more.
            let _ = tx.send(event.clone());
        });
        (sink, rx)
    }

    pub fn emit(&self, event: AdmissionEvent) {
        match &event {
            AdmissionEvent::Leader {
                client_id,
                signature,
                waiter_count,
            } => {
                self.stats.leaders.fetch_add(1, Ordering::Relaxed);
                if *waiter_count > 0 {
                    info!(
                        client_id = %client_id,
                        signature = %signature,
                        waiter_count = *waiter_count,
                        "Leader served coalesced requests"
                    );
                } else {
                    debug!(client_id = %client_id, signature = %signature, "Leader completed");
                }
            }
            AdmissionEvent::FollowerReused {
                client_id,
                signature,
            } => {
                self.stats.followers_reused.fetch_add(1, Ordering::Relaxed);
                debug!(client_id = %client_id, signature = %signature, "Follower reused leader response");
            }
            AdmissionEvent::FollowerTimeoutFallback {
                client_id,
                signature,
            } => {
                self.stats.follower_fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    client_id = %client_id,
                    signature = %signature,
                    "Follower timed out waiting for leader, executed independently"
                );
            }
            AdmissionEvent::RateLimited {
                client_id,
                path,
                retry_after_secs,
            } => {
                self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                warn!(
                    client_id = %client_id,
                    path = %path,
                    retry_after_secs = *retry_after_secs,
                    "Rate limit violation"
                );
            }
        }

        if let Some(handler) = &self.handler {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!(event = event.kind(), "Audit handler panicked, event dropped");
            }
        }
    }

    pub fn record_allowed(&self) {
        self.stats.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.stats.dedup_bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, pending_signatures: usize, tracked_clients: usize) -> AdmissionStatsSnapshot {
        AdmissionStatsSnapshot {
            allowed: self.stats.allowed.load(Ordering::Relaxed),
            rate_limited: self.stats.rate_limited.load(Ordering::Relaxed),
            leaders: self.stats.leaders.load(Ordering::Relaxed),
            followers_reused: self.stats.followers_reused.load(Ordering::Relaxed),
            follower_fallbacks: self.stats.follower_fallbacks.load(Ordering::Relaxed),
            dedup_bypassed: self.stats.dedup_bypassed.load(Ordering::Relaxed),
            pending_signatures,
            tracked_clients,
        }
    }
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink")
            .field("handler", &self.handler.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
