//! Fetcher Boundary
//!
//! The refresh scheduler talks to the ad server only through `Fetcher`.
//! Request payload construction and transport live behind it.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use tracing::debug;

use crate::error::{BidError, Result};
use crate::models::{BidResponse, FetchRequest};

/// Outcome of one fetch attempt. `Ok(None)` means the transport finished
/// without producing a response or an error.
pub type FetchResult = Result<Option<BidResponse>>;

/// In-flight fetch. Owns everything it needs so it can outlive the call.
pub type FetchFuture = Pin<Box<dyn Future<Output = FetchResult> + Send + 'static>>;

/// Issues bid requests for the scheduler.
///
/// `issue` is called synchronously, exactly once per scheduled attempt; the
/// returned future carries the pending result. It runs without any scheduler
/// lock held, so it may call back into its scheduler. A concurrent `stop`
/// waits for it to return, so it should only build the request and leave the
/// transport work to the future.
pub trait Fetcher: Send + Sync + 'static {
    fn issue(&self, request: FetchRequest) -> FetchFuture;
}

impl<F> Fetcher for F
where
    F: Fn(FetchRequest) -> FetchFuture + Send + Sync + 'static,
{
    fn issue(&self, request: FetchRequest) -> FetchFuture {
        self(request)
    }
}

// == File Fetcher ==
/// Serves a bid response stored on disk. Used by the demo binary to exercise
/// the scheduler without a network transport.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    path: PathBuf,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Fetcher for FileFetcher {
    fn issue(&self, request: FetchRequest) -> FetchFuture {
        let path = self.path.clone();
        Box::pin(async move {
            debug!(
                ad_unit = %request.ad_unit,
                session_depth = request.session_depth,
                path = %path.display(),
                "Reading bid response"
            );
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| BidError::FetchTransport(format!("{}: {}", path.display(), e)))?;

            // An empty body is the "no bid" answer
            if data.iter().all(u8::is_ascii_whitespace) {
                return Ok(Some(BidResponse::empty()));
            }
            BidResponse::from_json(&data).map(Some)
        })
    }
}
