//! Application Lifecycle Source
//!
//! Injectable stand-in for the platform's foreground/background
//! notifications. Hosts drive it from their own lifecycle callbacks; tests
//! drive it directly.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Backgrounded,
    Foregrounded,
}

/// Current foreground state plus a fan-out of transitions.
#[derive(Debug)]
pub struct Lifecycle {
    active: AtomicBool,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Lifecycle {
    pub fn new(active: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            active: AtomicBool::new(active),
            events,
        }
    }

    /// Synchronous query used by the timer-fire guard.
    pub fn is_application_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn notify_backgrounded(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.publish(LifecycleEvent::Backgrounded);
    }

    /// Flags the app active before publishing, so subscribers reacting to
    /// the event already see `is_application_active() == true`.
    pub fn notify_foregrounded(&self) {
        self.active.store(true, Ordering::SeqCst);
        self.publish(LifecycleEvent::Foregrounded);
    }

    fn publish(&self, event: LifecycleEvent) {
        // No subscribers is fine
        let receivers = self.events.send(event).unwrap_or(0);
        debug!(?event, receivers, "Lifecycle event published");
    }
}
