//! Periodic health with a grace window
//!
//! [`PeriodicHealth`] is constructed once at startup and handed to the seed
//! lease heartbeat (writer) and the readiness probe (reader). A positive
//! signal stays valid for the grace window so a slow reconcile pass does not
//! flap readiness; `set(false)` takes effect immediately.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::metrics;

/// Time source, swappable in tests
pub trait Clock: Send + Sync {
    /// Current monotonic instant
    fn now(&self) -> Instant;
}

/// Clock backed by tokio's monotonic time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug, Default)]
struct HealthState {
    healthy: bool,
    last_good: Option<Instant>,
}

/// Shared health flag with a "last good" timestamp
#[derive(Clone)]
pub struct PeriodicHealth {
    state: Arc<Mutex<HealthState>>,
    grace: Duration,
    clock: Arc<dyn Clock>,
}

impl PeriodicHealth {
    /// Create a monitor that starts unhealthy
    pub fn new(grace: Duration) -> Self {
        Self::with_clock(grace, Arc::new(SystemClock))
    }

    /// Create a monitor with an explicit time source
    pub fn with_clock(grace: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HealthState::default())),
            grace,
            clock,
        }
    }

    /// Configured grace window
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Record the outcome of the latest observation
    pub fn set(&self, healthy: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.healthy = healthy;
        if healthy {
            state.last_good = Some(self.clock.now());
        }
        metrics::set_seed_healthy(healthy);
    }

    /// True if last set healthy and the grace window has not run out since
    pub fn check(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match (state.healthy, state.last_good) {
            (true, Some(at)) => self.clock.now().saturating_duration_since(at) <= self.grace,
            _ => false,
        }
    }
}

impl std::fmt::Debug for PeriodicHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicHealth")
            .field("grace", &self.grace)
            .field("healthy", &self.check())
            .finish()
    }
}
