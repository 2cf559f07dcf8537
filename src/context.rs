//! Bid Context
//!
//! Owns the shared cache, session tracker and lifecycle source, and the
//! refresh schedulers built on them. Hosts create one per process and pass
//! it to whatever needs pre-bids.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::cache::{BidEvents, ConcurrentMap, LoggingEvents, PreBidCache};
use crate::config::Config;
use crate::fetcher::Fetcher;
use crate::lifecycle::Lifecycle;
use crate::models::BidResponse;
use crate::scheduler::{Backoff, RefreshScheduler, SchedulerDeps};
use crate::session::SessionTracker;

#[derive(Debug, Clone)]
pub struct BidContext {
    deps: SchedulerDeps,
    schedulers: Arc<ConcurrentMap<String, RefreshScheduler>>,
}

impl Default for BidContext {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl BidContext {
    /// Creates a context from configuration, logging loss/expire transitions.
    pub fn from_config(config: &Config) -> Self {
        Self::with_events(config, Arc::new(LoggingEvents))
    }

    /// Creates a context whose cache reports loss/expire transitions to `events`.
    pub fn with_events(config: &Config, events: Arc<dyn BidEvents>) -> Self {
        let default_ttl = Duration::try_from_secs_f64(config.default_ttl)
            .unwrap_or(Duration::from_secs(3600));
        let session_expiration = Duration::try_from_secs_f64(config.session_expiration)
            .unwrap_or(Duration::from_secs(30));

        Self::from_parts(SchedulerDeps {
            cache: Arc::new(PreBidCache::with_events(default_ttl, events)),
            session: Arc::new(SessionTracker::new(session_expiration)),
            lifecycle: Arc::new(Lifecycle::default()),
            backoff: Backoff::from_secs(config.backoff_base, config.backoff_cap),
        })
    }

    /// Wraps already-built collaborators.
    pub fn from_parts(deps: SchedulerDeps) -> Self {
        Self {
            deps,
            schedulers: Arc::new(ConcurrentMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<PreBidCache> {
        &self.deps.cache
    }

    pub fn session(&self) -> &Arc<SessionTracker> {
        &self.deps.session
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.deps.lifecycle
    }

    /// Builds a scheduler for `ad_unit` wired to this context. Not started.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    pub fn scheduler(&self, ad_unit: impl Into<String>, fetcher: Arc<dyn Fetcher>) -> RefreshScheduler {
        RefreshScheduler::spawn(ad_unit, fetcher, self.deps.clone())
    }

    /// Starts refreshing `ad_unit`, creating its scheduler on first use.
    /// A scheduler already registered for the key keeps its original fetcher.
    pub fn start_refresh(&self, ad_unit: &str, fetcher: Arc<dyn Fetcher>) -> RefreshScheduler {
        loop {
            let scheduler = self.registered_or_insert(ad_unit, &fetcher);
            scheduler.start();
            let still_registered = self
                .schedulers
                .get(ad_unit)
                .is_some_and(|current| current.same_worker(&scheduler));
            if still_registered {
                return scheduler;
            }
            // Unregistered by a concurrent stop_refresh before it started
            scheduler.stop();
        }
    }

    fn registered_or_insert(&self, ad_unit: &str, fetcher: &Arc<dyn Fetcher>) -> RefreshScheduler {
        if let Some(existing) = self.schedulers.get(ad_unit) {
            return existing;
        }
        let created = self.scheduler(ad_unit, Arc::clone(fetcher));
        if self.schedulers.insert_if_absent(ad_unit.to_string(), created.clone()) {
            info!(ad_unit, "Registered refresh scheduler");
            return created;
        }
        // Lost a registration race; the winner's scheduler is used
        self.schedulers.get(ad_unit).unwrap_or(created)
    }

    /// Stops and unregisters the scheduler for `ad_unit`. Returns false if none was registered.
    ///
    /// The scheduler is stopped before it leaves the registry. If a concurrent
    /// `start_refresh` restarts it in between, it stays registered.
    pub fn stop_refresh(&self, ad_unit: &str) -> bool {
        let Some(scheduler) = self.schedulers.get(ad_unit) else {
            return false;
        };
        self.unregister(ad_unit, &scheduler);
        info!(ad_unit, "Stopped refresh scheduler");
        true
    }

    /// Stops every registered scheduler.
    pub fn stop_all(&self) {
        for (ad_unit, scheduler) in self.schedulers.snapshot() {
            self.unregister(&ad_unit, &scheduler);
            debug!(ad_unit = %ad_unit, "Stopped refresh scheduler");
        }
    }

    fn unregister(&self, ad_unit: &str, scheduler: &RefreshScheduler) {
        scheduler.stop();
        self.schedulers.remove_if(ad_unit, |current| {
            current.same_worker(scheduler) && !current.is_active()
        });
    }

    /// Ad units with a registered scheduler.
    pub fn ad_units(&self) -> Vec<String> {
        self.schedulers
            .snapshot()
            .into_iter()
            .map(|(ad_unit, _)| ad_unit)
            .collect()
    }

    /// Single-use retrieval of the cached pre-bid for `ad_unit`.
    pub fn take(&self, ad_unit: &str) -> Option<Arc<BidResponse>> {
        self.deps.cache.take(ad_unit)
    }

    /// The host left the foreground: fires are skipped until it returns.
    pub fn application_backgrounded(&self) {
        self.deps.lifecycle.notify_backgrounded();
        self.deps.session.on_backgrounded();
    }

    /// The host is back: the session may reset, then schedulers re-arm.
    pub fn application_foregrounded(&self) {
        self.deps.session.on_foregrounded();
        self.deps.lifecycle.notify_foregrounded();
    }
}
