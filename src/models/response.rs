//! Bid response model
//!
//! Defines the decoded shape of a bid response returned by the ad server.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{BidError, Result};

/// Expiration applied when the server does not send `expiration_interval`.
pub const DEFAULT_EXPIRATION_SECONDS: f64 = 60.0 * 60.0;

/// Auction winner details.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Winner {
    #[serde(default)]
    pub partner: Option<String>,
    #[serde(default)]
    pub partner_placement_id: Option<String>,
    #[serde(default)]
    pub use_partner_rendering: Option<bool>,
    #[serde(default)]
    pub creative_type: Option<String>,
}

/// Result of a successful bid request.
///
/// Every field is optional on the wire; accessors apply the defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BidResponse {
    #[serde(default)]
    pub winner: Option<Winner>,
    #[serde(default)]
    pub creative: Option<String>,
    #[serde(default)]
    pub prebid_keywords: Option<String>,
    /// Auto-refresh interval in seconds
    #[serde(default)]
    pub refresh: Option<i64>,
    /// Lifetime of this response in the cache, in seconds
    #[serde(default)]
    pub expiration_interval: Option<f64>,
    /// Server override of the session inactivity threshold
    #[serde(default)]
    pub session_expiration_interval: Option<f64>,

    #[serde(default)]
    pub impression_urls: Vec<String>,
    #[serde(default)]
    pub click_urls: Vec<String>,
    #[serde(default)]
    pub selected_urls: Vec<String>,
    #[serde(default)]
    pub handoff_urls: Vec<String>,
    #[serde(default)]
    pub expire_urls: Vec<String>,
    #[serde(default)]
    pub loss_urls: Vec<String>,
}

impl BidResponse {
    /// Decodes a response body.
    ///
    /// # Errors
    /// Returns `BidError::InvalidResponse` when the body is not a JSON object
    /// of the expected shape.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| BidError::InvalidResponse(e.to_string()))
    }

    /// A "no bid" answer (HTTP 204): a successful fetch with nothing to show.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when the server asked for a follow-up fetch.
    pub fn should_auto_refresh(&self) -> bool {
        matches!(self.refresh, Some(interval) if interval > 0)
    }

    /// Auto-refresh interval in seconds, if the server sent one.
    pub fn auto_refresh_interval_seconds(&self) -> Option<f64> {
        if self.refresh.is_none() {
            debug!("Refresh interval not set in bid response");
        }
        self.refresh.map(|secs| secs as f64)
    }

    pub fn expiration_interval_seconds(&self) -> f64 {
        self.expiration_interval
            .unwrap_or(DEFAULT_EXPIRATION_SECONDS)
    }

    /// Cache lifetime as a `Duration`. Negative or NaN values collapse to zero;
    /// intervals too large to represent saturate at `Duration::MAX`.
    pub fn expiration(&self) -> Duration {
        let seconds = self.expiration_interval_seconds();
        if seconds.is_nan() || seconds <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }

    pub fn partner_name(&self) -> Option<&str> {
        self.winner
            .as_ref()
            .map(|w| w.partner.as_deref().unwrap_or(""))
    }

    pub fn partner_placement_id(&self) -> Option<&str> {
        self.winner.as_ref().and_then(|w| w.partner_placement_id.as_deref())
    }

    pub fn use_partner_rendering(&self) -> bool {
        self.winner
            .as_ref()
            .and_then(|w| w.use_partner_rendering)
            .unwrap_or(false)
    }

    pub fn creative_type(&self) -> &str {
        self.winner
            .as_ref()
            .and_then(|w| w.creative_type.as_deref())
            .unwrap_or("empty")
    }

    /// Keywords used to match this bid to a line item. Empty when nobody won.
    pub fn prebid_keywords(&self) -> &str {
        match self.winner {
            Some(_) => self.prebid_keywords.as_deref().unwrap_or(""),
            None => "",
        }
    }
}
