//! Fetch request handed to a `Fetcher`

/// One scheduled fetch attempt for an ad unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Ad unit (cache key) being refreshed
    pub ad_unit: String,
    /// Session depth before this attempt is recorded; the first request of a
    /// session reports 0
    pub session_depth: u64,
}

impl FetchRequest {
    pub fn new(ad_unit: impl Into<String>, session_depth: u64) -> Self {
        Self {
            ad_unit: ad_unit.into(),
            session_depth,
        }
    }
}
