//! Refresh Scheduling
//!
//! One `RefreshScheduler` per ad unit keeps its cache entry fresh:
//! - Auto-refresh on the server-directed interval after a success
//! - Exponential backoff retries after a failure
//! - Re-arm as soon as the application returns to the foreground

mod backoff;
mod refresh;

pub use backoff::Backoff;
pub use refresh::{RefreshPhase, RefreshScheduler, RefreshStatus, SchedulerDeps};
