//! Pre-Bid Cache Module
//!
//! Holds at most one fetch outcome per ad unit and hands each out at most once.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{BidEvents, CacheEntry, CacheStats, ConcurrentMap, LoggingEvents, StatCounters};
use crate::error::{BidError, Result};
use crate::models::{BidResponse, DEFAULT_EXPIRATION_SECONDS};

// == Pre-Bid Cache ==
/// Shared by every scheduler and consumer; safe to use from any thread.
pub struct PreBidCache {
    entries: ConcurrentMap<String, CacheEntry>,
    events: Arc<dyn BidEvents>,
    stats: StatCounters,
    default_ttl: Duration,
}

impl std::fmt::Debug for PreBidCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreBidCache")
            .field("entries", &self.entries.count())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl Default for PreBidCache {
    fn default() -> Self {
        Self::new(Duration::from_secs_f64(DEFAULT_EXPIRATION_SECONDS))
    }
}

impl PreBidCache {
    // == Constructor ==
    /// Creates a cache that logs loss/expire transitions.
    ///
    /// # Arguments
    /// * `default_ttl` - TTL for entries whose response carries no expiration interval
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_events(default_ttl, Arc::new(LoggingEvents))
    }

    /// Creates a cache reporting loss/expire transitions to `events`.
    pub fn with_events(default_ttl: Duration, events: Arc<dyn BidEvents>) -> Self {
        Self {
            entries: ConcurrentMap::new(),
            events,
            stats: StatCounters::default(),
            default_ttl,
        }
    }

    // == Put ==
    /// Records a completed fetch attempt for `ad_unit`.
    ///
    /// The previous entry, if it held a response, is finalized first: as
    /// expired when stale, otherwise as lost. The swap itself is atomic, so
    /// two concurrent puts each finalize a distinct predecessor.
    pub fn put(&self, ad_unit: &str, outcome: Result<Arc<BidResponse>>) {
        let entry = CacheEntry::new(outcome, self.default_ttl);
        match entry.response() {
            Some(response) => debug!(
                ad_unit,
                partner = ?response.partner_name(),
                ttl_secs = entry.ttl.as_secs_f64(),
                "Cached pre-bid"
            ),
            None => debug!(ad_unit, "Cached pre-bid error"),
        }

        let now = entry.created_at;
        if let Some(previous) = self.entries.set(ad_unit.to_string(), entry) {
            self.finalize_superseded(ad_unit, previous, now);
        }
    }

    fn finalize_superseded(&self, ad_unit: &str, previous: CacheEntry, now: Instant) {
        let Some(response) = previous.response() else {
            return;
        };
        if previous.is_expired_at(now) {
            self.stats.record_expiration();
            self.events.on_expired(ad_unit, response);
        } else {
            self.stats.record_loss();
            self.events.on_loss(ad_unit, response);
        }
    }

    // == Try Take ==
    /// Removes the entry for `ad_unit` and returns its response.
    ///
    /// The entry is removed whatever the outcome, so a second call right
    /// after always reports a miss.
    ///
    /// # Errors
    /// * `CacheMiss` - nothing cached for the key
    /// * `EntryExpired` - the entry outlived its TTL; the expire hook fires
    /// * the stored fetch error, when the last attempt failed
    pub fn try_take(&self, ad_unit: &str) -> Result<Arc<BidResponse>> {
        let Some(entry) = self.entries.remove(ad_unit) else {
            self.stats.record_miss();
            debug!(ad_unit, "Pre-bid was not found");
            return Err(BidError::CacheMiss(ad_unit.to_string()));
        };

        let response = match &entry.outcome {
            Ok(response) => Arc::clone(response),
            Err(err) => {
                self.stats.record_miss();
                warn!(ad_unit, error = %err, "Pre-bid error was found");
                return Err(err.clone());
            }
        };

        if entry.is_expired() {
            self.stats.record_miss();
            self.stats.record_expiration();
            self.events.on_expired(ad_unit, &response);
            return Err(BidError::EntryExpired(ad_unit.to_string()));
        }

        self.stats.record_hit();
        debug!(ad_unit, "Pre-bid taken");
        Ok(response)
    }

    // == Take ==
    /// Single-use retrieval: returns the cached response at most once.
    pub fn take(&self, ad_unit: &str) -> Option<Arc<BidResponse>> {
        self.try_take(ad_unit).ok()
    }

    /// True if an entry (of any kind, possibly stale) is cached for `ad_unit`.
    pub fn contains(&self, ad_unit: &str) -> bool {
        self.entries.get(ad_unit).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    // == Stats ==
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.entries.count())
    }
}
