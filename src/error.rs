//! Error types for the pre-bid subsystem
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Bid Error Enum ==
/// Unified error type for fetching, caching and consuming pre-bids.
///
/// Cloneable so a failed fetch can be parked in the cache and handed back
/// to whichever consumer asks for that key next.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BidError {
    /// Network or server failure while fetching a bid
    #[error("Fetch transport error: {0}")]
    FetchTransport(String),

    /// Transport succeeded but the payload could not be understood
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// No entry present for the key
    #[error("No pre-bid cached for: {0}")]
    CacheMiss(String),

    /// Entry existed but outlived its TTL
    #[error("Pre-bid expired: {0}")]
    EntryExpired(String),
}

// == Result Type Alias ==
/// Convenience Result type for the pre-bid subsystem.
pub type Result<T> = std::result::Result<T, BidError>;
