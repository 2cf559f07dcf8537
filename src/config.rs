//! Configuration Module
//!
//! Handles loading cache, session and refresh settings from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Runtime configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// TTL in seconds for cached responses that carry no expiration interval
    pub default_ttl: f64,
    /// Seconds spent in the background before the session depth resets
    pub session_expiration: f64,
    /// Base of the exponential retry delay, in seconds
    pub backoff_base: f64,
    /// Upper bound of the retry delay, in seconds
    pub backoff_cap: f64,
    /// Ad unit keys the demo binary schedules
    pub ad_units: Vec<String>,
    /// JSON file served by the demo binary's fetcher
    pub response_file: Option<PathBuf>,
    /// How often the demo binary consumes each key, in seconds
    pub take_interval: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `PREBID_DEFAULT_TTL` - Default entry TTL in seconds (default: 3600)
    /// - `SESSION_EXPIRATION` - Session inactivity threshold in seconds (default: 30)
    /// - `BACKOFF_BASE` - Retry backoff base (default: 2)
    /// - `BACKOFF_CAP` - Retry backoff cap in seconds (default: 30)
    /// - `AD_UNITS` - Comma-separated ad unit keys (default: none)
    /// - `RESPONSE_FILE` - Path to a JSON bid response (default: none)
    /// - `TAKE_INTERVAL` - Demo consumer interval in seconds (default: 5)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_ttl: parse_var("PREBID_DEFAULT_TTL").unwrap_or(defaults.default_ttl),
            session_expiration: parse_var("SESSION_EXPIRATION")
                .unwrap_or(defaults.session_expiration),
            backoff_base: parse_var("BACKOFF_BASE").unwrap_or(defaults.backoff_base),
            backoff_cap: parse_var("BACKOFF_CAP").unwrap_or(defaults.backoff_cap),
            ad_units: env::var("AD_UNITS")
                .map(|v| parse_ad_units(&v))
                .unwrap_or(defaults.ad_units),
            response_file: env::var("RESPONSE_FILE").ok().map(PathBuf::from),
            take_interval: parse_var("TAKE_INTERVAL").unwrap_or(defaults.take_interval),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_ttl: 3600.0,
            session_expiration: 30.0,
            backoff_base: 2.0,
            backoff_cap: 30.0,
            ad_units: Vec::new(),
            response_file: None,
            take_interval: 5,
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_ad_units(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
