//! Cache Module
//!
//! Provides the thread-safe map primitive and the single-use pre-bid cache
//! built on it.

mod concurrent_map;
mod entry;
mod events;
mod prebid;
mod stats;


// Re-export public types
pub use concurrent_map::ConcurrentMap;
pub use entry::CacheEntry;
pub use events::{BidEvents, LoggingEvents};
pub use prebid::PreBidCache;
pub use stats::CacheStats;
pub(crate) use stats::StatCounters;
