//! Retransmission timer.
//!
//! Reliable delivery requires that unacknowledged characters are re-sent if
//! no acknowledgment arrives within a bounded time.  [`RetransmitTimer`] is a
//! resettable, stoppable, single-fire countdown with a fixed duration:
//!
//! - Created **stopped**; nothing fires until [`start`](RetransmitTimer::start).
//! - `start()` (re)arms the timer to fire exactly once, one duration in the
//!   future, cancelling any pending prior firing.
//! - `stop()` disarms it; a fire that already elapsed but was never observed
//!   is discarded, so a stale fire can never leak into a later cycle.
//! - [`expired`](RetransmitTimer::expired) is awaited inside `tokio::select!`
//!   alongside the other events of the owning task, guarded by
//!   [`is_armed`](RetransmitTimer::is_armed).
//!
//! Internally this is the pinned-`Sleep`-plus-armed-flag pattern: a disarmed
//! timer is parked a year in the future, and the armed flag keeps a parked or
//! stale deadline from ever being acted on.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Instant, Sleep};

/// Park deadline for a disarmed timer.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

/// A single-fire countdown with a fixed duration.
#[derive(Debug)]
pub struct RetransmitTimer {
    sleep: Pin<Box<Sleep>>,
    duration: Duration,
    armed: bool,
}

impl RetransmitTimer {
    /// Create a stopped timer that will count down `duration` once started.
    pub fn new(duration: Duration) -> Self {
        Self {
            sleep: Box::pin(sleep(FAR_FUTURE)),
            duration,
            armed: false,
        }
    }

    /// (Re)arm the timer to fire once, one duration from now.
    ///
    /// Any pending firing from a previous arming is cancelled.
    pub fn start(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.duration);
        self.armed = true;
    }

    /// Disarm the timer and discard any not-yet-observed firing.
    pub fn stop(&mut self) {
        self.armed = false;
        self.sleep.as_mut().reset(Instant::now() + FAR_FUTURE);
    }

    /// `true` while a firing is pending.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Wait for the pending firing.
    ///
    /// Completes at most once per [`start`](Self::start): observing the fire
    /// disarms the timer and parks the deadline again.  Select on this with
    /// an `if timer.is_armed()` guard.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await;
        self.armed = false;
        let park = Instant::now() + FAR_FUTURE;
        self.sleep.as_mut().reset(park);
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    const D: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn created_stopped() {
        let mut t = RetransmitTimer::new(D);
        assert!(!t.is_armed());
        // A stopped timer never fires, no matter how long we wait.
        assert!(timeout(D * 10, t.expired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_duration() {
        let mut t = RetransmitTimer::new(D);
        t.start();
        assert!(t.is_armed());

        timeout(D * 2, t.expired()).await.expect("timer should fire");
        assert!(!t.is_armed(), "observing the fire disarms the timer");

        // Single-fire: no second firing without another start().
        assert!(timeout(D * 10, t.expired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_fire_early() {
        let mut t = RetransmitTimer::new(D);
        t.start();
        assert!(timeout(D - Duration::from_millis(1), t.expired())
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_discards_pending_fire() {
        let mut t = RetransmitTimer::new(D);
        t.start();

        // Let the deadline elapse without observing the fire.
        advance(D * 2).await;
        t.stop();
        assert!(!t.is_armed());

        // The stale fire must not leak out after the stop.
        assert!(timeout(D * 10, t.expired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_measures_from_the_restart() {
        let mut t = RetransmitTimer::new(D);
        t.start();
        advance(Duration::from_millis(80)).await;

        // Re-arm: the old 100ms deadline is cancelled.
        t.start();
        assert!(timeout(Duration::from_millis(99), t.expired())
            .await
            .is_err());
        timeout(D, t.expired()).await.expect("timer should fire");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_start_rearms() {
        let mut t = RetransmitTimer::new(D);
        t.start();
        t.stop();
        t.start();
        timeout(D * 2, t.expired()).await.expect("timer should fire");
    }
}
