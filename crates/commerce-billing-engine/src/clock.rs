//! Time source for the engine.
//!
//! Workflows sleep on tokio timers but record wall-clock timestamps. A [`Clock`] bridges the
//! two so a test runtime with paused time moves billing time forward as well.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// The current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// The tokio instant at which `at` will be reached. Past times map to now.
    fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        let delta = (at - self.now()).to_std().unwrap_or(Duration::ZERO);
        Instant::now() + delta
    }
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that follows tokio's clock from a fixed starting point.
///
/// Under `tokio::time::pause` (or `#[tokio::test(start_paused = true)]`) time only moves
/// when the runtime advances it, and this clock moves with it.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor: DateTime<Utc>,
    started: Instant,
}

impl TokioClock {
    /// Start at `anchor`, now.
    #[must_use]
    pub fn starting_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor + elapsed
    }
}
