//! Integration Tests for Refresh Scheduling
//!
//! Drives schedulers end to end against scripted fetchers. Most tests run on
//! a paused clock so delays are exact.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prebid_cache::scheduler::SchedulerDeps;
use prebid_cache::{
    Backoff, BidContext, BidError, BidResponse, FetchFuture, FetchRequest, FetchResult, Fetcher,
    Lifecycle, PreBidCache, RefreshPhase, RefreshScheduler, RefreshStatus, SessionTracker,
};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

// == Helper Types ==

/// Plays back scripted outcomes, then repeats `fallback` forever.
struct ScriptedFetcher {
    script: Mutex<VecDeque<FetchResult>>,
    fallback: FetchResult,
    calls: Mutex<Vec<(Instant, FetchRequest)>>,
}

impl ScriptedFetcher {
    fn new(script: Vec<FetchResult>, fallback: FetchResult) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn always(outcome: FetchResult) -> Arc<Self> {
        Self::new(Vec::new(), outcome)
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Seconds between consecutive issued fetches.
    fn gaps(&self) -> Vec<u64> {
        let calls = self.calls.lock().unwrap();
        calls
            .windows(2)
            .map(|pair| (pair[1].0 - pair[0].0).as_secs())
            .collect()
    }

    fn depths(&self) -> Vec<u64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, request)| request.session_depth)
            .collect()
    }
}

impl Fetcher for ScriptedFetcher {
    fn issue(&self, request: FetchRequest) -> FetchFuture {
        self.calls.lock().unwrap().push((Instant::now(), request));
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        Box::pin(async move { outcome })
    }
}

/// Holds every fetch until `release` is notified; tracks overlap.
struct GatedFetcher {
    release: Arc<Notify>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    calls: AtomicUsize,
}

impl GatedFetcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            release: Arc::new(Notify::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            calls: AtomicUsize::new(0),
        })
    }
}

impl Fetcher for GatedFetcher {
    fn issue(&self, _request: FetchRequest) -> FetchFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let release = Arc::clone(&self.release);
        let in_flight = Arc::clone(&self.in_flight);
        Box::pin(async move {
            release.notified().await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(refreshing(60)))
        })
    }
}

// == Helper Functions ==

fn refreshing(secs: i64) -> BidResponse {
    BidResponse {
        refresh: Some(secs),
        creative: Some(format!("refresh-{}", secs)),
        ..BidResponse::default()
    }
}

fn transport_error() -> FetchResult {
    Err(BidError::FetchTransport("connection refused".into()))
}

fn test_context(backoff: Backoff) -> BidContext {
    BidContext::from_parts(SchedulerDeps {
        cache: Arc::new(PreBidCache::default()),
        session: Arc::new(SessionTracker::default()),
        lifecycle: Arc::new(Lifecycle::default()),
        backoff,
    })
}

async fn wait_for(
    status: &mut watch::Receiver<RefreshStatus>,
    what: &str,
    predicate: impl FnMut(&RefreshStatus) -> bool,
) -> RefreshStatus {
    tokio::time::timeout(Duration::from_secs(24 * 3600), status.wait_for(predicate))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
        .expect("scheduler worker exited")
        .clone()
}

/// Lets queued worker commands run without moving the paused clock.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// == Backoff ==

#[tokio::test(start_paused = true)]
async fn test_failure_backoff_sequence() {
    let context = test_context(Backoff::default());
    let fetcher = ScriptedFetcher::always(transport_error());
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    scheduler.start();
    wait_for(&mut status, "six fetches", |s| s.fetches >= 6).await;
    scheduler.stop();

    assert_eq!(fetcher.gaps()[..5], [2, 4, 8, 16, 30]);
    assert!(matches!(
        context.cache().try_take("banner"),
        Err(BidError::FetchTransport(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_error_count() {
    let context = test_context(Backoff::default());
    let fetcher = ScriptedFetcher::new(
        vec![transport_error(), transport_error()],
        Ok(Some(refreshing(5))),
    );
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    scheduler.start();
    let after_errors = wait_for(&mut status, "two failures", |s| s.error_count == 2).await;
    assert!(matches!(after_errors.last_result, Some(Err(_))));

    let recovered = wait_for(&mut status, "recovery", |s| {
        s.error_count == 0 && matches!(s.last_result, Some(Ok(_)))
    })
    .await;
    assert_eq!(recovered.error_count, 0);

    wait_for(&mut status, "five fetches", |s| s.fetches >= 5).await;
    scheduler.stop();

    assert_eq!(fetcher.gaps()[..4], [2, 4, 5, 5]);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_response_is_retried() {
    let context = test_context(Backoff::default());
    let fetcher = ScriptedFetcher::always(Err(BidError::InvalidResponse("truncated".into())));
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    scheduler.start();
    let current = wait_for(&mut status, "three failures", |s| s.error_count >= 3).await;
    scheduler.stop();

    assert_eq!(current.next_delay, Some(Duration::from_secs(8)));
    assert_eq!(fetcher.gaps()[..2], [2, 4]);
}

// == Success Paths ==

#[tokio::test(start_paused = true)]
async fn test_auto_refresh_interval_and_session_depth() {
    let context = test_context(Backoff::default());
    let fetcher = ScriptedFetcher::always(Ok(Some(refreshing(10))));
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    scheduler.start();
    wait_for(&mut status, "three fetches", |s| s.fetches >= 3).await;
    scheduler.stop();

    assert_eq!(fetcher.gaps(), vec![10, 10]);
    assert_eq!(fetcher.depths(), vec![0, 1, 2]);

    let taken = context.take("banner").expect("cached response");
    assert_eq!(taken.creative.as_deref(), Some("refresh-10"));
    assert!(context.take("banner").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_non_refreshing_response_ends_cycle() {
    let context = test_context(Backoff::default());
    let fetcher = ScriptedFetcher::always(Ok(Some(BidResponse::empty())));
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    scheduler.start();
    wait_for(&mut status, "idle", |s| s.phase == RefreshPhase::Idle).await;

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(fetcher.call_count(), 1);

    // Still active, so start is a no-op
    scheduler.start();
    settle().await;
    assert_eq!(fetcher.call_count(), 1);
    assert!(scheduler.is_active());

    // Returning to the foreground re-arms it
    scheduler.on_application_foregrounded();
    wait_for(&mut status, "second fetch", |s| s.fetches >= 2).await;
    assert_eq!(fetcher.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_server_session_expiration_applied() {
    let context = test_context(Backoff::default());
    let response = BidResponse {
        session_expiration_interval: Some(90.0),
        ..BidResponse::default()
    };
    let fetcher = ScriptedFetcher::always(Ok(Some(response)));
    let scheduler = context.scheduler("banner", fetcher);
    let mut status = scheduler.status();

    scheduler.start();
    wait_for(&mut status, "idle", |s| s.phase == RefreshPhase::Idle).await;

    assert_eq!(context.session().expiration(), Duration::from_secs(90));
}

// == Stall ==

#[tokio::test(start_paused = true)]
async fn test_empty_outcome_stalls() {
    let context = test_context(Backoff::default());
    let fetcher = ScriptedFetcher::always(Ok(None));
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    scheduler.start();
    let stalled = wait_for(&mut status, "idle", |s| s.phase == RefreshPhase::Idle).await;
    assert!(stalled.last_result.is_none());

    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(fetcher.call_count(), 1);
    assert_eq!(context.session().depth(), 1);
    assert!(context.cache().is_empty());
}

// == Lifecycle ==

#[tokio::test(start_paused = true)]
async fn test_background_suppresses_and_foreground_rearms() {
    let context = test_context(Backoff::default());
    let fetcher = ScriptedFetcher::always(Ok(Some(refreshing(10))));
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    scheduler.start();
    wait_for(&mut status, "first fetch scheduled", |s| {
        s.fetches == 1 && s.phase == RefreshPhase::Scheduled
    })
    .await;

    context.application_backgrounded();
    wait_for(&mut status, "suppressed fire", |s| s.phase == RefreshPhase::Suspended).await;
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(fetcher.call_count(), 1);

    // Back within the session window: depth survives
    context.application_foregrounded();
    wait_for(&mut status, "refetch on foreground", |s| s.fetches >= 2).await;
    scheduler.stop();

    assert_eq!(fetcher.depths(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_background_fire_during_fetch_keeps_fetching_phase() {
    let context = test_context(Backoff::default());
    let fetcher = GatedFetcher::new();
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    scheduler.start();
    wait_for(&mut status, "fetching", |s| s.phase == RefreshPhase::Fetching).await;

    // Re-arm while the fetch is out, then leave the foreground before it fires
    scheduler.on_application_foregrounded();
    context.application_backgrounded();
    settle().await;
    assert_eq!(status.borrow().phase, RefreshPhase::Fetching);

    fetcher.release.notify_one();
    wait_for(&mut status, "suppressed follow-up", |s| s.phase == RefreshPhase::Suspended).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert!(scheduler.is_active());
    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn test_long_background_resets_session_depth() {
    let context = test_context(Backoff::default());
    let fetcher = ScriptedFetcher::always(Ok(Some(refreshing(10))));
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    scheduler.start();
    wait_for(&mut status, "two fetches", |s| s.fetches >= 2).await;

    context.application_backgrounded();
    tokio::time::sleep(Duration::from_secs(120)).await;
    context.application_foregrounded();
    wait_for(&mut status, "third fetch", |s| s.fetches >= 3).await;
    scheduler.stop();

    assert_eq!(fetcher.depths(), vec![0, 1, 0]);
}

// == Stop ==

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_refresh() {
    let context = test_context(Backoff::default());
    let fetcher = ScriptedFetcher::always(Ok(Some(refreshing(10))));
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    scheduler.start();
    wait_for(&mut status, "scheduled", |s| {
        s.fetches == 1 && s.phase == RefreshPhase::Scheduled
    })
    .await;

    scheduler.stop();
    assert!(!scheduler.is_active());
    wait_for(&mut status, "suspended", |s| s.phase == RefreshPhase::Suspended).await;

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(fetcher.call_count(), 1);

    scheduler.start();
    wait_for(&mut status, "restart fetch", |s| s.fetches >= 2).await;
    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_fetching_still_caches() {
    let context = test_context(Backoff::default());
    let fetcher = GatedFetcher::new();
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    scheduler.start();
    wait_for(&mut status, "fetching", |s| s.phase == RefreshPhase::Fetching).await;

    scheduler.stop();
    fetcher.release.notify_one();
    wait_for(&mut status, "suspended", |s| s.phase == RefreshPhase::Suspended).await;

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert!(context.take("banner").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_foreground_during_fetch_is_single_flight() {
    let context = test_context(Backoff::default());
    let fetcher = GatedFetcher::new();
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    scheduler.start();
    wait_for(&mut status, "fetching", |s| s.phase == RefreshPhase::Fetching).await;

    scheduler.on_application_foregrounded();
    settle().await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    fetcher.release.notify_one();
    wait_for(&mut status, "follow-up fetch", |s| s.fetches >= 2).await;
    fetcher.release.notify_one();
    wait_for(&mut status, "scheduled", |s| s.phase == RefreshPhase::Scheduled).await;
    scheduler.stop();

    assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fetcher_may_call_back_into_scheduler() {
    let context = test_context(Backoff::default());
    let slot: Arc<Mutex<Option<RefreshScheduler>>> = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let fetcher: Arc<dyn Fetcher> = {
        let slot = Arc::clone(&slot);
        let seen = Arc::clone(&seen);
        Arc::new(move |_request: FetchRequest| -> FetchFuture {
            if let Some(scheduler) = slot.lock().unwrap().as_ref() {
                seen.lock().unwrap().push((scheduler.is_active(), format!("{:?}", scheduler)));
                if seen.lock().unwrap().len() == 2 {
                    scheduler.stop();
                }
            }
            Box::pin(async { Ok(Some(refreshing(10))) })
        })
    };
    let scheduler = context.scheduler("banner", fetcher);
    *slot.lock().unwrap() = Some(scheduler.clone());
    let mut status = scheduler.status();

    scheduler.start();
    wait_for(&mut status, "first fetch", |s| {
        s.fetches == 1 && s.phase == RefreshPhase::Scheduled
    })
    .await;
    assert!(context.take("banner").is_some());

    // The second attempt stops its own scheduler, so its fetch is dropped
    wait_for(&mut status, "stopped from fetcher", |s| s.phase == RefreshPhase::Suspended).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|(active, _)| *active));
    assert!(seen[0].1.contains("banner"));
    assert_eq!(status.borrow().fetches, 1);
    assert!(!scheduler.is_active());
    assert!(context.take("banner").is_none());
    slot.lock().unwrap().take();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_stop_and_start_settle_consistently() {
    let context = test_context(Backoff::default());
    let fetcher = ScriptedFetcher::always(Ok(Some(refreshing(3600))));
    let scheduler = context.scheduler("banner", fetcher.clone());
    let mut status = scheduler.status();

    for _ in 0..100 {
        scheduler.start();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let stopper = {
            let scheduler = scheduler.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                scheduler.stop();
            })
        };
        let starter = {
            let scheduler = scheduler.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                scheduler.start();
            })
        };
        stopper.join().unwrap();
        starter.join().unwrap();

        // Whichever call won, an active scheduler must not report itself suspended
        scheduler.start();
        let settled = status.wait_for(|s| {
            s.phase == RefreshPhase::Scheduled || s.phase == RefreshPhase::Fetching
        });
        tokio::time::timeout(Duration::from_secs(5), settled)
            .await
            .expect("active scheduler stuck in suspended phase")
            .expect("scheduler worker exited");
        assert!(scheduler.is_active());

        scheduler.stop();
        let stopped = status.wait_for(|s| s.phase == RefreshPhase::Suspended);
        tokio::time::timeout(Duration::from_secs(5), stopped)
            .await
            .expect("stop not reported")
            .expect("scheduler worker exited");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_is_race_free() {
    // 1ms cap keeps timers firing constantly
    let context = test_context(Backoff::new(2.0, Duration::from_millis(1)));
    let fetcher = ScriptedFetcher::always(transport_error());
    let scheduler = context.scheduler("banner", fetcher.clone());

    for i in 0..200u64 {
        scheduler.start();
        tokio::time::sleep(Duration::from_micros(250 * (i % 8))).await;

        scheduler.stop();
        let at_stop = fetcher.call_count();
        tokio::time::sleep(Duration::from_millis(3)).await;

        assert_eq!(fetcher.call_count(), at_stop, "fetch issued after stop in iteration {}", i);
    }
}

// == Context ==

#[tokio::test(start_paused = true)]
async fn test_context_schedules_many_ad_units() {
    let context = test_context(Backoff::default());
    let fetcher = ScriptedFetcher::always(Ok(Some(refreshing(30))));

    let mut statuses: Vec<_> = (0..8)
        .map(|i| context.start_refresh(&format!("unit-{}", i), fetcher.clone()).status())
        .collect();

    for status in &mut statuses {
        wait_for(status, "first fetch", |s| s.fetches >= 1 && s.phase == RefreshPhase::Scheduled)
            .await;
    }

    assert_eq!(context.cache().len(), 8);
    context.stop_all();
    assert!(context.ad_units().is_empty());
}
