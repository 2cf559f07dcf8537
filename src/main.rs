//! Pre-Bid Cache demo runner
//!
//! Keeps a pre-bid fresh for each configured ad unit, serving responses from
//! a JSON file instead of the network, and periodically consumes them the way
//! a rendering layer would.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prebid_cache::{BidContext, Config, Fetcher, FileFetcher};

/// Main entry point for the demo runner.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Create the bid context (cache, session, lifecycle)
/// 4. Start a refresh scheduler per ad unit
/// 5. Take each ad unit's pre-bid on the configured interval
/// 6. Stop every scheduler on SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prebid_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting pre-bid cache");

    let config = Config::from_env();
    info!(
        "Configuration loaded: default_ttl={}s, session_expiration={}s, backoff={}^n capped at {}s, ad_units={:?}",
        config.default_ttl,
        config.session_expiration,
        config.backoff_base,
        config.backoff_cap,
        config.ad_units
    );

    if config.ad_units.is_empty() {
        bail!("AD_UNITS is empty, nothing to refresh");
    }
    let response_file = config
        .response_file
        .clone()
        .context("RESPONSE_FILE must point at a JSON bid response")?;

    let context = BidContext::from_config(&config);
    let fetcher: Arc<dyn Fetcher> = Arc::new(FileFetcher::new(response_file));
    for ad_unit in &config.ad_units {
        context.start_refresh(ad_unit, Arc::clone(&fetcher));
    }
    info!("Refresh schedulers started");

    let consumer = tokio::spawn(consume(context.clone(), config.take_interval));

    shutdown_signal().await;

    consumer.abort();
    context.stop_all();
    let stats = context.cache().stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        losses = stats.losses,
        expirations = stats.expirations,
        "Shutdown complete"
    );
    Ok(())
}

/// Takes every ad unit's pre-bid on a fixed interval and logs what came back.
async fn consume(context: BidContext, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    // The first tick completes immediately; let the schedulers fetch first
    ticker.tick().await;

    loop {
        ticker.tick().await;
        for ad_unit in context.ad_units() {
            match context.cache().try_take(&ad_unit) {
                Ok(response) => info!(
                    ad_unit = %ad_unit,
                    partner = ?response.partner_name(),
                    creative_type = response.creative_type(),
                    keywords = response.prebid_keywords(),
                    "Took pre-bid"
                ),
                Err(err) => warn!(ad_unit = %ad_unit, error = %err, "No pre-bid available"),
            }
        }
    }
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
