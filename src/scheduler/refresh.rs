//! Per-ad-unit refresh state machine
//!
//! A worker task owns the refresh state and processes every transition in
//! order: start, stop, timer fires, fetch completions, foreground events.
//! Callers on any thread only push commands; `stop` additionally cancels the
//! armed timer under the gate lock so it takes effect before it returns.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::PreBidCache;
use crate::error::Result;
use crate::fetcher::{FetchResult, Fetcher};
use crate::lifecycle::{Lifecycle, LifecycleEvent};
use crate::models::{BidResponse, FetchRequest};
use crate::scheduler::Backoff;
use crate::session::SessionTracker;

/// Shared collaborators every scheduler reports into.
#[derive(Debug, Clone)]
pub struct SchedulerDeps {
    pub cache: Arc<PreBidCache>,
    pub session: Arc<SessionTracker>,
    pub lifecycle: Arc<Lifecycle>,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    /// Not running, or waiting for the application to come back to the foreground
    Suspended,
    /// Timer armed
    Scheduled,
    /// Fetch in flight
    Fetching,
    /// Active, but the last outcome asked for no further refresh
    Idle,
}

/// Observable view of a scheduler's state.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshStatus {
    pub phase: RefreshPhase,
    /// Consecutive failed fetches
    pub error_count: u32,
    /// Delay of the currently armed timer
    pub next_delay: Option<Duration>,
    /// Fetches issued since the scheduler was created
    pub fetches: u64,
    pub last_result: Option<Result<Arc<BidResponse>>>,
}

impl Default for RefreshStatus {
    fn default() -> Self {
        Self {
            phase: RefreshPhase::Suspended,
            error_count: 0,
            next_delay: None,
            fetches: 0,
            last_result: None,
        }
    }
}

enum Command {
    Arm { epoch: u64 },
    Stopped { epoch: u64 },
    Foregrounded,
    TimerFired { epoch: u64 },
    FetchCompleted(FetchResult),
}

/// State touched both by callers and by the worker.
///
/// `epoch` changes on every start, stop and arm; a timer fire or arm request
/// carrying an older epoch is stale and dropped.
#[derive(Debug, Default)]
struct Gate {
    active: bool,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
    /// Thread currently inside `Fetcher::issue`, called without the lock held
    issuer: Option<ThreadId>,
}

#[derive(Debug, Default)]
struct Shared {
    gate: Mutex<Gate>,
    issued: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks while another thread is inside `Fetcher::issue`. A fetcher that
    /// calls back into its own scheduler does not wait on itself.
    fn wait_for_issue<'a>(&'a self, mut gate: MutexGuard<'a, Gate>) -> MutexGuard<'a, Gate> {
        let current = thread::current().id();
        while gate.issuer.is_some_and(|issuer| issuer != current) {
            gate = self.issued.wait(gate).unwrap_or_else(PoisonError::into_inner);
        }
        gate
    }
}

/// Clears the issuer marker even if `Fetcher::issue` panics.
struct IssueGuard<'a> {
    shared: &'a Shared,
}

impl Drop for IssueGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().issuer = None;
        self.shared.issued.notify_all();
    }
}

// == Refresh Scheduler ==
/// Handle to the refresh worker of one ad unit. Cloning shares the worker;
/// dropping the last clone stops it.
#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<Handle>,
}

struct Handle {
    ad_unit: Arc<str>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<RefreshStatus>,
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("ad_unit", &self.inner.ad_unit)
            .field("active", &self.is_active())
            .finish()
    }
}

impl RefreshScheduler {
    /// Spawns the worker for `ad_unit`. The scheduler starts suspended.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    pub fn spawn(ad_unit: impl Into<String>, fetcher: Arc<dyn Fetcher>, deps: SchedulerDeps) -> Self {
        let ad_unit: Arc<str> = Arc::from(ad_unit.into());
        let shared = Arc::new(Shared::default());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(RefreshStatus::default());
        let lifecycle_rx = deps.lifecycle.subscribe();

        let worker = Worker {
            ad_unit: Arc::clone(&ad_unit),
            shared: Arc::clone(&shared),
            commands: commands.downgrade(),
            status: status_tx,
            fetcher,
            deps,
            error_count: 0,
            fetching: false,
            fire_after_fetch: false,
        };
        tokio::spawn(worker.run(command_rx, lifecycle_rx));

        Self {
            inner: Arc::new(Handle {
                ad_unit,
                shared,
                commands,
                status,
            }),
        }
    }

    /// True when both handles drive the same worker.
    pub fn same_worker(&self, other: &RefreshScheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn ad_unit(&self) -> &str {
        &self.inner.ad_unit
    }

    pub fn is_active(&self) -> bool {
        self.inner.shared.lock().active
    }

    /// Watch the scheduler's phase, error count and last outcome.
    pub fn status(&self) -> watch::Receiver<RefreshStatus> {
        self.inner.status.clone()
    }

    /// Begins refreshing immediately. No-op when already active.
    pub fn start(&self) {
        self.inner.start();
    }

    /// Stops refreshing. Once this returns no further fetch is issued until
    /// the next `start`. A fetch already in flight still completes and is cached.
    ///
    /// If the worker is inside `Fetcher::issue` on another thread, this waits
    /// for that call to return and the fetch it produced is discarded.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Re-arms immediately if active. Also triggered by the lifecycle source.
    pub fn on_application_foregrounded(&self) {
        let _ = self.inner.commands.send(Command::Foregrounded);
    }
}

impl Handle {
    fn start(&self) {
        let epoch = {
            let mut gate = self.shared.lock();
            if gate.active {
                debug!(ad_unit = %self.ad_unit, "Refresh already active");
                return;
            }
            gate.active = true;
            gate.epoch += 1;
            gate.epoch
        };
        debug!(ad_unit = %self.ad_unit, "Refresh started");
        let _ = self.commands.send(Command::Arm { epoch });
    }

    fn stop(&self) {
        let epoch = {
            let mut gate = self.shared.lock();
            gate.active = false;
            gate.epoch += 1;
            if let Some(timer) = gate.timer.take() {
                timer.abort();
                debug!(ad_unit = %self.ad_unit, "Refresh timer invalidated");
            }
            let gate = self.shared.wait_for_issue(gate);
            gate.epoch
        };
        debug!(ad_unit = %self.ad_unit, "Refresh stopped");
        let _ = self.commands.send(Command::Stopped { epoch });
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.stop();
    }
}

// == Worker ==
struct Worker {
    ad_unit: Arc<str>,
    shared: Arc<Shared>,
    /// Weak so the channel closes once every handle is gone
    commands: mpsc::WeakUnboundedSender<Command>,
    status: watch::Sender<RefreshStatus>,
    fetcher: Arc<dyn Fetcher>,
    deps: SchedulerDeps,
    error_count: u32,
    fetching: bool,
    /// A timer fired while a fetch was in flight; fire again once it lands
    fire_after_fetch: bool,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut lifecycle: broadcast::Receiver<LifecycleEvent>,
    ) {
        let mut lifecycle_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                event = lifecycle.recv(), if lifecycle_open => match event {
                    Ok(LifecycleEvent::Foregrounded) => self.on_foregrounded(),
                    Ok(LifecycleEvent::Backgrounded) => {
                        debug!(ad_unit = %self.ad_unit, "Application backgrounded, fires will be skipped");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(ad_unit = %self.ad_unit, skipped, "Missed lifecycle events");
                        if self.deps.lifecycle.is_application_active() {
                            self.on_foregrounded();
                        }
                    }
                    Err(RecvError::Closed) => lifecycle_open = false,
                },
            }
        }
        debug!(ad_unit = %self.ad_unit, "Refresh worker exited");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Arm { epoch } => {
                let current = {
                    let gate = self.shared.lock();
                    gate.active && gate.epoch == epoch
                };
                if current {
                    self.arm(Duration::ZERO);
                }
            }
            Command::Stopped { epoch } => {
                // A start since this stop owns the phase now
                let current = {
                    let gate = self.shared.lock();
                    !gate.active && gate.epoch == epoch
                };
                if current && !self.fetching {
                    self.set_phase(RefreshPhase::Suspended, None);
                }
            }
            Command::Foregrounded => self.on_foregrounded(),
            Command::TimerFired { epoch } => self.on_timer_fired(epoch),
            Command::FetchCompleted(outcome) => self.on_fetch_completed(outcome),
        }
    }

    fn on_foregrounded(&mut self) {
        if self.shared.lock().active {
            debug!(ad_unit = %self.ad_unit, "Application foregrounded, requesting refresh");
            self.arm(Duration::ZERO);
        }
    }

    /// Replaces any armed timer with one firing after `delay`.
    fn arm(&mut self, delay: Duration) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        {
            let mut gate = self.shared.lock();
            if !gate.active {
                return;
            }
            gate.epoch += 1;
            let epoch = gate.epoch;
            if let Some(previous) = gate.timer.take() {
                previous.abort();
            }
            gate.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = commands.send(Command::TimerFired { epoch });
            }));
        }

        debug!(ad_unit = %self.ad_unit, delay_secs = delay.as_secs_f64(), "Scheduling refresh");
        if !self.fetching {
            self.set_phase(RefreshPhase::Scheduled, Some(delay));
        }
    }

    fn on_timer_fired(&mut self, epoch: u64) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        let request = {
            let mut gate = self.shared.lock();
            if gate.epoch != epoch {
                debug!(ad_unit = %self.ad_unit, "Discarding stale refresh timer");
                return;
            }
            gate.timer = None;
            if !gate.active {
                return;
            }
            if self.fetching {
                self.fire_after_fetch = true;
                return;
            }
            if !self.deps.lifecycle.is_application_active() {
                drop(gate);
                debug!(ad_unit = %self.ad_unit, "Auto-refresh cancelled, application is not active");
                self.set_phase(RefreshPhase::Suspended, None);
                return;
            }
            gate.issuer = Some(thread::current().id());
            FetchRequest::new(&*self.ad_unit, self.deps.session.depth())
        };

        debug!(ad_unit = %self.ad_unit, session_depth = request.session_depth, "Issuing fetch");
        let guard = IssueGuard {
            shared: &self.shared,
        };
        let pending = self.fetcher.issue(request);

        {
            let mut gate = self.shared.lock();
            gate.issuer = None;
            self.shared.issued.notify_all();
            // Stopped while issuing: the stop is already reported as complete
            if gate.epoch != epoch || !gate.active {
                debug!(ad_unit = %self.ad_unit, "Refresh stopped while issuing, discarding fetch");
                return;
            }
            self.fetching = true;
            tokio::spawn(async move {
                let outcome = pending.await;
                let _ = commands.send(Command::FetchCompleted(outcome));
            });
        }
        drop(guard);

        self.status.send_modify(|status| {
            status.phase = RefreshPhase::Fetching;
            status.next_delay = None;
            status.fetches += 1;
        });
    }

    fn on_fetch_completed(&mut self, outcome: FetchResult) {
        self.fetching = false;
        self.deps.session.record_attempt();

        let (next, last_result) = match outcome {
            Ok(Some(response)) => {
                if let Some(seconds) = response.session_expiration_interval {
                    self.deps.session.set_expiration_seconds(seconds);
                }
                let response = Arc::new(response);
                self.deps.cache.put(&self.ad_unit, Ok(Arc::clone(&response)));
                self.error_count = 0;

                let next = if response.should_auto_refresh() {
                    response
                        .auto_refresh_interval_seconds()
                        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                } else {
                    info!(ad_unit = %self.ad_unit, "Response does not request auto-refresh, refresh cycle ends");
                    None
                };
                (next, Some(Ok(response)))
            }
            Err(err) => {
                self.deps.cache.put(&self.ad_unit, Err(err.clone()));
                self.error_count = self.error_count.saturating_add(1);
                let delay = self.deps.backoff.delay(self.error_count);
                error!(
                    ad_unit = %self.ad_unit,
                    error = %err,
                    retry_attempt = self.error_count,
                    delay_secs = delay.as_secs_f64(),
                    "Fetch failed, retrying with backoff"
                );
                (Some(delay), Some(Err(err)))
            }
            Ok(None) => {
                warn!(
                    ad_unit = %self.ad_unit,
                    "Fetch produced neither a response nor an error, no refresh will be scheduled"
                );
                (None, None)
            }
        };

        let error_count = self.error_count;
        self.status.send_modify(|status| {
            status.error_count = error_count;
            if last_result.is_some() {
                status.last_result = last_result;
            }
        });

        let next = if std::mem::take(&mut self.fire_after_fetch) {
            Some(Duration::ZERO)
        } else {
            next
        };

        let active = self.shared.lock().active;
        match next {
            Some(delay) if active => self.arm(delay),
            _ if active => self.set_phase(RefreshPhase::Idle, None),
            _ => self.set_phase(RefreshPhase::Suspended, None),
        }
    }

    fn set_phase(&self, phase: RefreshPhase, next_delay: Option<Duration>) {
        self.status.send_modify(|status| {
            status.phase = phase;
            status.next_delay = next_delay;
        });
    }
}
