//! Session Tracking
//!
//! Counts fetch attempts since the user last spent a long stretch outside
//! the application.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Default inactivity threshold before the session resets.
pub const DEFAULT_SESSION_EXPIRATION_SECONDS: f64 = 30.0;

/// Mutable session state, guarded by the tracker's lock.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub depth: u64,
    pub left_foreground_at: Option<Instant>,
    pub expiration: Duration,
}

/// Process-wide session depth counter.
///
/// Pure state transitions: the host (or `BidContext`) feeds lifecycle events
/// in, nothing here runs timers or I/O.
#[derive(Debug)]
pub struct SessionTracker {
    state: Mutex<SessionState>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs_f64(DEFAULT_SESSION_EXPIRATION_SECONDS))
    }
}

impl SessionTracker {
    pub fn new(expiration: Duration) -> Self {
        Self {
            state: Mutex::new(SessionState {
                depth: 0,
                left_foreground_at: None,
                expiration,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch attempts recorded since the last reset.
    pub fn depth(&self) -> u64 {
        self.lock().depth
    }

    pub fn expiration(&self) -> Duration {
        self.lock().expiration
    }

    pub fn snapshot(&self) -> SessionState {
        self.lock().clone()
    }

    /// Counts one fetch attempt, whatever its outcome. Returns the new depth.
    pub fn record_attempt(&self) -> u64 {
        let mut state = self.lock();
        state.depth += 1;
        debug!(depth = state.depth, "Session depth incremented");
        state.depth
    }

    pub fn on_backgrounded(&self) {
        let mut state = self.lock();
        state.left_foreground_at = Some(Instant::now());
        debug!("Session recorded user leaving app");
    }

    /// Resets depth when the user stayed away longer than the threshold, or
    /// when no departure was ever recorded. Returns true if it reset.
    pub fn on_foregrounded(&self) -> bool {
        let mut state = self.lock();
        let expired = match state.left_foreground_at {
            Some(left) => Instant::now().saturating_duration_since(left) > state.expiration,
            None => true,
        };

        if expired {
            debug!(previous_depth = state.depth, "Session expired, resetting depth");
            state.depth = 0;
        } else {
            debug!(
                expiration_secs = state.expiration.as_secs_f64(),
                "Session kept, user came back within the expiration window"
            );
        }
        expired
    }

    /// Server-directed override of the inactivity threshold, in seconds.
    /// Negative or non-finite values are ignored.
    pub fn set_expiration_seconds(&self, seconds: f64) {
        match Duration::try_from_secs_f64(seconds) {
            Ok(expiration) => {
                self.lock().expiration = expiration;
                debug!(seconds, "Session expiration updated");
            }
            Err(_) => debug!(seconds, "Ignoring invalid session expiration"),
        }
    }
}
