//! Data models exchanged with the ad server
//!
//! The request side is reduced to what the refresh scheduler hands the
//! fetcher; payload construction lives with the transport.

pub mod request;
pub mod response;

// Re-export commonly used types
pub use request::FetchRequest;
pub use response::{BidResponse, Winner, DEFAULT_EXPIRATION_SECONDS};
