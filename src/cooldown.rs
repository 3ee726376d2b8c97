//! Process-wide back-pressure gate for the accrual provider.
//!
//! The provider rate-limits per client, so a single gate is shared by every
//! reconciliation worker: once any worker sees a rate-limit response, all of
//! them hold off until the window has elapsed.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// How often a waiting worker re-checks the gate.
pub const POLL_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    period: Duration,
}

#[derive(Debug)]
pub struct CooldownGate {
    default_period: Duration,
    window: Mutex<Option<Window>>,
}

impl CooldownGate {
    pub fn new(default_period: Duration) -> Self {
        Self {
            default_period,
            window: Mutex::new(None),
        }
    }

    pub fn default_period(&self) -> Duration {
        self.default_period
    }

    /// Starts a cooldown window of `period` (or the default) from now.
    /// A later signal replaces any window already in force.
    pub fn signal_rate_limited(&self, period: Option<Duration>) {
        let period = period.unwrap_or(self.default_period);
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        *window = Some(Window {
            started: Instant::now(),
            period,
        });
        info!(cooldown_secs = period.as_secs(), "accrual provider cooldown started");
    }

    /// True when no window is active or the active one has elapsed.
    /// An elapsed window is cleared.
    pub fn is_ready(&self) -> bool {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        match *window {
            None => true,
            Some(w) if Instant::now() >= w.started + w.period => {
                *window = None;
                debug!("accrual provider cooldown elapsed");
                true
            }
            Some(_) => false,
        }
    }

    /// Sleeps in [`POLL_STEP`] increments until the gate opens.
    ///
    /// Returns `false` if `shutdown` fires first.
    pub async fn wait_ready(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown.borrow() {
                return false;
            }
            if self.is_ready() {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_STEP) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // sender gone, nobody can ask us to stop any more
                        tokio::time::sleep(POLL_STEP).await;
                    }
                }
            }
        }
    }
}
