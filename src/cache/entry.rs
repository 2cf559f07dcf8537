//! Cache Entry Module
//!
//! Defines the structure for a cached fetch outcome with TTL support.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::BidError;
use crate::models::BidResponse;

// == Cache Entry ==
/// One completed fetch attempt for an ad unit.
///
/// Holds either the response or the error the fetch produced, never both.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Outcome of the fetch
    pub outcome: Result<Arc<BidResponse>, BidError>,
    /// Creation instant
    pub created_at: Instant,
    /// Lifetime after which the entry is stale
    pub ttl: Duration,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an entry stamped with the current instant.
    ///
    /// # Arguments
    /// * `outcome` - The response or error the fetch produced
    /// * `default_ttl` - TTL used unless the response carries its own expiration
    pub fn new(outcome: Result<Arc<BidResponse>, BidError>, default_ttl: Duration) -> Self {
        let ttl = match &outcome {
            Ok(response) if response.expiration_interval.is_some() => response.expiration(),
            _ => default_ttl,
        };

        Self {
            outcome,
            created_at: Instant::now(),
            ttl,
        }
    }

    /// The cached response, if the fetch succeeded.
    pub fn response(&self) -> Option<&Arc<BidResponse>> {
        self.outcome.as_ref().ok()
    }

    // == Is Expired ==
    /// Checks if the entry has expired at `now`.
    ///
    /// Boundary condition: an entry is stale only once strictly more than
    /// `ttl` has elapsed, so it is still valid at exactly `created_at + ttl`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    // == Time To Live ==
    /// Returns remaining lifetime, `Duration::ZERO` once elapsed.
    pub fn ttl_remaining(&self) -> Duration {
        self.ttl
            .saturating_sub(Instant::now().saturating_duration_since(self.created_at))
    }
}
