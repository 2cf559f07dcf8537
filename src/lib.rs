//! Pre-Bid Cache - client-side bid caching with adaptive refresh
//!
//! Keeps one short-lived bid per ad unit, hands each out at most once, and
//! refreshes it on a schedule that follows server directives, backs off on
//! failure and pauses while the application is in the background.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod fetcher;
pub mod lifecycle;
pub mod models;
pub mod scheduler;
pub mod session;

pub use cache::PreBidCache;
pub use config::Config;
pub use context::BidContext;
pub use error::{BidError, Result};
pub use fetcher::{FetchFuture, FetchResult, Fetcher, FileFetcher};
pub use lifecycle::{Lifecycle, LifecycleEvent};
pub use models::{BidResponse, FetchRequest};
pub use scheduler::{Backoff, RefreshPhase, RefreshScheduler, RefreshStatus, SchedulerDeps};
pub use session::SessionTracker;
