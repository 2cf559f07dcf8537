//! Finalize hooks fired when a cached pre-bid leaves the cache unused.

use tracing::{debug, info};

use crate::models::BidResponse;

/// Receives the terminal transition of a cached response.
///
/// Each entry is finalized at most once: superseded while live (loss), or
/// found stale on access (expired). Consumed entries are not reported.
/// Called outside any cache lock.
pub trait BidEvents: Send + Sync {
    /// A newer fetch replaced a still-valid response.
    fn on_loss(&self, ad_unit: &str, response: &BidResponse);

    /// The response outlived its TTL before anyone took it.
    fn on_expired(&self, ad_unit: &str, response: &BidResponse);
}

/// Default hooks: log the transition and the tracking URLs a host would fire.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEvents;

impl BidEvents for LoggingEvents {
    fn on_loss(&self, ad_unit: &str, response: &BidResponse) {
        info!(
            ad_unit,
            partner = ?response.partner_name(),
            "Pre-bid lost to a newer response"
        );
        for url in &response.loss_urls {
            debug!(ad_unit, %url, "Loss tracking URL");
        }
    }

    fn on_expired(&self, ad_unit: &str, response: &BidResponse) {
        info!(
            ad_unit,
            partner = ?response.partner_name(),
            "Pre-bid expired before use"
        );
        for url in &response.expire_urls {
            debug!(ad_unit, %url, "Expire tracking URL");
        }
    }
}
