//! # Single Flight Module
//!
//! A request-shape-agnostic single-flight primitive. For a given key at most one
//! unit of work is in flight; callers that arrive with the same key while it runs
//! wait for it and receive a copy of its result, value or error.
//!
//! ## Roles
//!
//! - **Leader**: the first caller for a key. Runs the work, publishes the result,
//!   and removes the entry after a short grace window so near-simultaneous
//!   stragglers still pick up the result.
//! - **Follower**: a caller that found an entry. Waits up to the TTL. If the leader
//!   publishes in time the follower returns the leader's result; otherwise it runs
//!   its own work independently without touching the leader's entry.
//! - **Bypass**: the registry already tracks `max_pending` keys, or the group has
//!   been shut down. The caller runs its work directly.
//!
//! ## Locking
//!
//! The registry is a single map behind a `parking_lot::Mutex`. The lock is held
//! for lookup/insert/remove only and never across the work itself, so a slow
//! leader does not hold up unrelated keys. The completion signal is a
//! `tokio::sync::watch` channel holding a write-once slot: every follower that
//! subscribed before or after completion observes the published value.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_PENDING: usize = 1000;
pub const DEFAULT_GRACE: Duration = Duration::from_millis(50);

///////////////////////////////////////////////////////////////////////////////
//****                         Public Types                              ****//
///////////////////////////////////////////////////////////////////////////////

/// Error half of a flight result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlightError<E> {
    /// The leader's work failed; followers get the same error
    Failed(E),
    /// The entry outlived the forced-expiry age and was completed by the sweeper
    Expired(Duration),
    /// The group was shut down while the entry was pending
    Shutdown,
}

impl<E: fmt::Display> fmt::Display for FlightError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlightError::Failed(e) => write!(f, "{}", e),
            FlightError::Expired(age) => {
                write!(f, "in-flight request expired after {:?}", age)
            }
            FlightError::Shutdown => write!(f, "single-flight group shut down"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for FlightError<E> {}

pub type FlightResult<T, E> = Result<T, FlightError<E>>;

/// How a caller's result was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    /// Ran the work and published it to `waiters` followers
    Leader { waiters: u64 },
    /// Reused the leader's published result
    Follower,
    /// Waited past the TTL (or the leader was abandoned) and ran the work itself
    FollowerFallback,
    /// Never registered: registry full or group shut down
    Bypass,
}

/// Tagged outcome of `SingleFlightGroup::run`
#[derive(Debug, Clone)]
pub struct FlightOutcome<T, E> {
    pub role: FlightRole,
    pub result: FlightResult<T, E>,
}

/// Registry sizing and timing
#[derive(Debug, Clone)]
pub struct SingleFlightConfig {
    /// Longest a follower waits before running the work itself
    pub ttl: Duration,
    /// Distinct keys tracked at once; further keys bypass deduplication
    pub max_pending: usize,
    /// How long a completed entry stays visible to stragglers
    pub grace: Duration,
}

impl Default for SingleFlightConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_pending: DEFAULT_MAX_PENDING,
            grace: DEFAULT_GRACE,
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                        Private Types                              ****//
///////////////////////////////////////////////////////////////////////////////

/// Value held in the completion slot
#[derive(Clone)]
enum Slot<T, E> {
    Pending,
    Done(FlightResult<T, E>),
    /// Leader went away without publishing
    Abandoned,
}

struct PendingEntry<T, E> {
    generation: u64,
    started_at: Instant,
    signal: watch::Sender<Slot<T, E>>,
    waiters: AtomicU64,
}

impl<T, E> PendingEntry<T, E> {
    /// Write-once transition out of `Pending`. Returns false if already completed.
    fn complete(&self, slot: Slot<T, E>) -> bool {
        let mut slot = Some(slot);
        self.signal.send_if_modified(|current| {
            if matches!(current, Slot::Pending) {
                if let Some(next) = slot.take() {
                    *current = next;
                }
                true
            } else {
                false
            }
        })
    }

    fn is_pending(&self) -> bool {
        matches!(*self.signal.borrow(), Slot::Pending)
    }
}

struct Inner<K, T, E> {
    config: SingleFlightConfig,
    registry: Mutex<HashMap<K, Arc<PendingEntry<T, E>>>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

enum Attach<T, E> {
    Leader(Arc<PendingEntry<T, E>>),
    Follower(Arc<PendingEntry<T, E>>),
    Bypass,
}

enum WaitOutcome<T, E> {
    Completed(FlightResult<T, E>),
    TimedOut,
    Abandoned,
}

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Deduplicates concurrent work per key. Cheap to clone; clones share the registry.
pub struct SingleFlightGroup<K, T, E> {
    inner: Arc<Inner<K, T, E>>,
}

impl<K, T, E> Clone for SingleFlightGroup<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, T, E> fmt::Debug for SingleFlightGroup<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlightGroup")
            .field("config", &self.inner.config)
            .field("pending", &self.inner.registry.lock().len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, T, E> SingleFlightGroup<K, T, E>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(config: SingleFlightConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Run `work` for `key`, or share the result of the run already in flight
    pub async fn run<F, Fut>(&self, key: K, work: F) -> FlightOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.attach(&key) {
            Attach::Leader(entry) => self.lead(key, entry, work).await,
            Attach::Follower(entry) => match self.wait(&entry).await {
                WaitOutcome::Completed(result) => FlightOutcome {
                    role: FlightRole::Follower,
                    result,
                },
                WaitOutcome::TimedOut | WaitOutcome::Abandoned => {
                    // Informational only; the leader never reads it back for correctness.
                    let _ = entry.waiters.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                        n.checked_sub(1)
                    });
                    FlightOutcome {
                        role: FlightRole::FollowerFallback,
                        result: work().await.map_err(FlightError::Failed),
                    }
                }
            },
            Attach::Bypass => FlightOutcome {
                role: FlightRole::Bypass,
                result: work().await.map_err(FlightError::Failed),
            },
        }
    }

    /// Number of keys currently registered, pending or in their grace window
    pub fn pending_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Force-complete entries that have been pending longer than `max_age`.
    /// Returns the number of entries expired.
    pub fn expire_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<(K, Arc<PendingEntry<T, E>>)> = {
            let mut registry = self.inner.registry.lock();
            let stale: Vec<K> = registry
                .iter()
                .filter(|(_, entry)| {
                    entry.is_pending() && now.duration_since(entry.started_at) > max_age
                })
                .map(|(key, _)| key.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|key| registry.remove(&key).map(|entry| (key, entry)))
                .collect()
        };

        for (key, entry) in &expired {
            let age = now.duration_since(entry.started_at);
            if entry.complete(Slot::Done(Err(FlightError::Expired(age)))) {
                warn!(
                    key = ?key,
                    age_ms = age.as_millis() as u64,
                    waiters = entry.waiters.load(Ordering::Relaxed),
                    "Forced expiry of stale in-flight entry"
                );
            }
        }

        expired.len()
    }

    /// Release every pending entry with a shutdown error and stop deduplicating.
    /// Returns the number of entries released.
    pub fn shutdown(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Arc<PendingEntry<T, E>>> = {
            let mut registry = self.inner.registry.lock();
            registry.drain().map(|(_, entry)| entry).collect()
        };

        drained
            .iter()
            .filter(|entry| entry.complete(Slot::Done(Err(FlightError::Shutdown))))
            .count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn attach(&self, key: &K) -> Attach<T, E> {
        if self.is_shut_down() {
            return Attach::Bypass;
        }

        let mut registry = self.inner.registry.lock();
        if let Some(entry) = registry.get(key) {
            entry.waiters.fetch_add(1, Ordering::Relaxed);
            return Attach::Follower(entry.clone());
        }

        if registry.len() >= self.inner.config.max_pending {
            debug!(
                key = ?key,
                max_pending = self.inner.config.max_pending,
                "Single-flight registry full, bypassing"
            );
            return Attach::Bypass;
        }

        let (signal, _) = watch::channel(Slot::Pending);
        let entry = Arc::new(PendingEntry {
            generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
            started_at: Instant::now(),
            signal,
            waiters: AtomicU64::new(0),
        });
        registry.insert(key.clone(), entry.clone());
        Attach::Leader(entry)
    }

    async fn lead<F, Fut>(
        &self,
        key: K,
        entry: Arc<PendingEntry<T, E>>,
        work: F,
    ) -> FlightOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut guard = LeaderGuard {
            group: self.clone(),
            key: Some(key),
            entry: entry.clone(),
        };

        let result = work().await.map_err(FlightError::Failed);
        entry.complete(Slot::Done(result.clone()));
        let waiters = entry.waiters.load(Ordering::Relaxed);

        if let Some(key) = guard.key.take() {
            self.schedule_removal(key, entry.generation);
        }

        FlightOutcome {
            role: FlightRole::Leader { waiters },
            result,
        }
    }

    async fn wait(&self, entry: &PendingEntry<T, E>) -> WaitOutcome<T, E> {
        let mut rx = entry.signal.subscribe();
        let waited = tokio::time::timeout(
            self.inner.config.ttl,
            rx.wait_for(|slot| !matches!(slot, Slot::Pending)),
        )
        .await;

        match waited {
            Ok(Ok(slot)) => match &*slot {
                Slot::Done(result) => WaitOutcome::Completed(result.clone()),
                Slot::Abandoned | Slot::Pending => WaitOutcome::Abandoned,
            },
            // Sender lives in the entry we hold, so a closed channel means it was torn down.
            Ok(Err(_)) => WaitOutcome::Abandoned,
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    fn schedule_removal(&self, key: K, generation: u64) {
        let grace = self.inner.config.grace;
        if grace.is_zero() {
            self.remove_generation(&key, generation);
            return;
        }

        let group = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            group.remove_generation(&key, generation);
        });
    }

    /// Remove `key` only if it still maps to the entry we created
    fn remove_generation(&self, key: &K, generation: u64) {
        let mut registry = self.inner.registry.lock();
        if registry
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            registry.remove(key);
        }
    }
}

impl<K, T, E> Default for SingleFlightGroup<K, T, E>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(SingleFlightConfig::default())
    }
}

/// Releases the entry if the leader's future is dropped before it publishes
struct LeaderGuard<K, T, E>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    group: SingleFlightGroup<K, T, E>,
    key: Option<K>,
    entry: Arc<PendingEntry<T, E>>,
}

impl<K, T, E> Drop for LeaderGuard<K, T, E>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if self.entry.complete(Slot::Abandoned) {
                debug!(key = ?key, "Leader dropped before completing, releasing followers");
            }
            self.group.remove_generation(&key, self.entry.generation);
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
