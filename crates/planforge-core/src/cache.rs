//! Process-local cache of active and recently-finished generation requests.
//!
//! A latency optimization only: the ledger stays authoritative, the cache is
//! never shared across server instances, and every read path that consults
//! it must fall back to the ledger. Entries expire after a TTL and the whole
//! cache vanishes on process restart, by design.
//!
//! The cache is an explicit component with an injected clock -- it is
//! constructed once per process and passed by handle, never reached through
//! a global, so tests can substitute a manual clock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use uuid::Uuid;

/// Default entry lifetime: requests untouched for this long read as absent.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Clock abstraction so tests can drive time by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The production clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Terminality of a cached request, mirroring the ledger vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    InProgress,
    Complete,
    Error,
}

/// One cached request.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: CacheStatus,
    pub started_at: Instant,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub insight_changes: Value,
    /// Last mutation time; drives TTL eviction.
    updated_at: Instant,
}

/// Elapsed-time phase table for clients polling before any explicit update
/// has been recorded. Caps below 95 so an estimate never looks finished.
const PHASE_TABLE: &[(Duration, u8, &str)] = &[
    (Duration::from_secs(10), 5, "profile"),
    (Duration::from_secs(30), 20, "planning"),
    (Duration::from_secs(60), 45, "generating"),
    (Duration::from_secs(120), 70, "optimizing"),
];

/// Estimate shown once elapsed time runs past the phase table.
const PHASE_TAIL: (u8, &str) = (94, "finalizing");

/// The ephemeral request cache.
pub struct RequestCache {
    clock: Box<dyn Clock>,
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, CacheEntry>>,
}

impl RequestCache {
    /// Cache with the production clock and default TTL.
    pub fn new() -> Self {
        Self::with_clock(Box::new(SystemClock), DEFAULT_TTL)
    }

    /// Cache with an injected clock and TTL (used by tests).
    pub fn with_clock(clock: Box<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record that generation started for a request.
    pub fn start(&self, id: Uuid) {
        let now = self.clock.now();
        self.lock().insert(
            id,
            CacheEntry {
                status: CacheStatus::InProgress,
                started_at: now,
                result_ref: None,
                error: None,
                insight_changes: Value::Null,
                updated_at: now,
            },
        );
    }

    /// Record a successful completion.
    pub fn complete(&self, id: Uuid, result_ref: &str, insight_changes: Value) {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries.entry(id).or_insert_with(|| CacheEntry {
            status: CacheStatus::InProgress,
            started_at: now,
            result_ref: None,
            error: None,
            insight_changes: Value::Null,
            updated_at: now,
        });
        entry.status = CacheStatus::Complete;
        entry.result_ref = Some(result_ref.to_owned());
        entry.error = None;
        entry.insight_changes = insight_changes;
        entry.updated_at = now;
    }

    /// Record a failure with its classified message.
    pub fn error(&self, id: Uuid, message: &str) {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries.entry(id).or_insert_with(|| CacheEntry {
            status: CacheStatus::InProgress,
            started_at: now,
            result_ref: None,
            error: None,
            insight_changes: Value::Null,
            updated_at: now,
        });
        entry.status = CacheStatus::Error;
        entry.error = Some(message.to_owned());
        entry.updated_at = now;
    }

    /// Look up a request. Entries past the TTL are evicted and read as
    /// absent.
    pub fn get(&self, id: Uuid) -> Option<CacheEntry> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(&id) {
            Some(entry) if now.duration_since(entry.updated_at) > self.ttl => {
                entries.remove(&id);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    /// Estimated `(percent, phase)` for an in-progress request, derived
    /// purely from elapsed wall-clock time since [`RequestCache::start`].
    ///
    /// Monotonically increasing and capped below 95, so a polling client
    /// never sees an estimate that looks complete. `None` for unknown,
    /// expired, or terminal entries.
    pub fn estimate_progress(&self, id: Uuid) -> Option<(u8, &'static str)> {
        let entry = self.get(id)?;
        if entry.status != CacheStatus::InProgress {
            return None;
        }
        let elapsed = self.clock.now().duration_since(entry.started_at);
        Some(estimate_for_elapsed(elapsed))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CacheEntry>> {
        // A poisoned cache is an empty cache, never a crash: the ledger is
        // the fallback on every path.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Map elapsed time through the fixed phase table.
fn estimate_for_elapsed(elapsed: Duration) -> (u8, &'static str) {
    for &(upper, percent, phase) in PHASE_TABLE {
        if elapsed < upper {
            return (percent, phase);
        }
    }
    PHASE_TAIL
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    /// A clock the test advances by hand.
    #[derive(Clone)]
    struct ManualClock {
        base: Instant,
        offset_ms: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset_ms: Arc::new(AtomicU64::new(0)),
            }
        }

        fn advance(&self, d: Duration) {
            self.offset_ms
                .fetch_add(d.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
        }
    }

    fn cache_with_manual_clock(ttl: Duration) -> (RequestCache, ManualClock) {
        let clock = ManualClock::new();
        let cache = RequestCache::with_clock(Box::new(clock.clone()), ttl);
        (cache, clock)
    }

    #[test]
    fn start_then_get() {
        let (cache, _clock) = cache_with_manual_clock(DEFAULT_TTL);
        let id = Uuid::new_v4();

        assert!(cache.get(id).is_none());
        cache.start(id);
        let entry = cache.get(id).expect("entry should exist");
        assert_eq!(entry.status, CacheStatus::InProgress);
    }

    #[test]
    fn complete_overwrites_in_progress() {
        let (cache, _clock) = cache_with_manual_clock(DEFAULT_TTL);
        let id = Uuid::new_v4();
        cache.start(id);
        cache.complete(id, "plan-123", serde_json::json!({"volume": "+10%"}));

        let entry = cache.get(id).unwrap();
        assert_eq!(entry.status, CacheStatus::Complete);
        assert_eq!(entry.result_ref.as_deref(), Some("plan-123"));
        assert_eq!(entry.insight_changes["volume"], "+10%");
    }

    #[test]
    fn error_records_message() {
        let (cache, _clock) = cache_with_manual_clock(DEFAULT_TTL);
        let id = Uuid::new_v4();
        cache.start(id);
        cache.error(id, "generation timed out");

        let entry = cache.get(id).unwrap();
        assert_eq!(entry.status, CacheStatus::Error);
        assert_eq!(entry.error.as_deref(), Some("generation timed out"));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (cache, clock) = cache_with_manual_clock(Duration::from_secs(600));
        let id = Uuid::new_v4();
        cache.start(id);

        clock.advance(Duration::from_secs(599));
        assert!(cache.get(id).is_some());

        clock.advance(Duration::from_secs(2));
        assert!(cache.get(id).is_none(), "expired entry must read as absent");
        assert!(cache.estimate_progress(id).is_none());
    }

    #[test]
    fn terminal_write_refreshes_ttl() {
        let (cache, clock) = cache_with_manual_clock(Duration::from_secs(600));
        let id = Uuid::new_v4();
        cache.start(id);

        clock.advance(Duration::from_secs(500));
        cache.complete(id, "plan-9", Value::Null);

        // 500s after start but only 100s after completion: still present.
        clock.advance(Duration::from_secs(100));
        assert!(cache.get(id).is_some());
    }

    #[test]
    fn estimate_walks_the_phase_table() {
        let (cache, clock) = cache_with_manual_clock(DEFAULT_TTL);
        let id = Uuid::new_v4();
        cache.start(id);

        assert_eq!(cache.estimate_progress(id), Some((5, "profile")));

        clock.advance(Duration::from_secs(15));
        assert_eq!(cache.estimate_progress(id), Some((20, "planning")));

        clock.advance(Duration::from_secs(30));
        assert_eq!(cache.estimate_progress(id), Some((45, "generating")));

        clock.advance(Duration::from_secs(45));
        assert_eq!(cache.estimate_progress(id), Some((70, "optimizing")));

        clock.advance(Duration::from_secs(300));
        let (percent, phase) = cache.estimate_progress(id).unwrap();
        assert_eq!(phase, "finalizing");
        assert!(percent < 95, "estimate must cap below 95");
    }

    #[test]
    fn estimate_is_monotone_over_time() {
        let (cache, clock) = cache_with_manual_clock(DEFAULT_TTL);
        let id = Uuid::new_v4();
        cache.start(id);

        let mut last = 0u8;
        for _ in 0..40 {
            clock.advance(Duration::from_secs(5));
            if let Some((percent, _)) = cache.estimate_progress(id) {
                assert!(percent >= last, "estimate regressed: {percent} < {last}");
                last = percent;
            }
        }
    }

    #[test]
    fn no_estimate_for_terminal_entries() {
        let (cache, _clock) = cache_with_manual_clock(DEFAULT_TTL);
        let id = Uuid::new_v4();
        cache.start(id);
        cache.complete(id, "plan-1", Value::Null);
        assert!(cache.estimate_progress(id).is_none());
    }
}
