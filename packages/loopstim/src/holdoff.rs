// Refractory (hold-off) timer
//
// The `active` flag is authoritative for the crossing detector; the timer is
// only the mechanism that clears it. Every arming bumps a generation counter so
// a timer that was superseded or cancelled can never clear a newer arming.

use crate::config::HoldOffClock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

enum TimerClock {
    Samples {
        hold_samples: u64,
        deadline: Option<u64>,
    },
    Wall {
        handle: Handle,
        parent: CancellationToken,
        current: Option<CancellationToken>,
    },
}

/// One-shot timer that blocks re-arming of the detector after an ascending crossing
pub struct HoldOffTimer {
    hold_off: Duration,
    active: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    clock: TimerClock,
}

impl HoldOffTimer {
    /// Hold-off measured in hardware sample ticks
    pub fn sample_clock(hold_off_secs: f64, sample_rate: f64) -> Self {
        Self {
            hold_off: Duration::from_secs_f64(hold_off_secs),
            active: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            clock: TimerClock::Samples {
                hold_samples: (hold_off_secs * sample_rate).round() as u64,
                deadline: None,
            },
        }
    }

    /// Hold-off measured in wall-clock time by a sleep task on `handle`
    pub fn wall_clock(hold_off_secs: f64, handle: Handle, parent: CancellationToken) -> Self {
        Self {
            hold_off: Duration::from_secs_f64(hold_off_secs),
            active: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            clock: TimerClock::Wall {
                handle,
                parent,
                current: None,
            },
        }
    }

    /// Build the timer for `clock`; wall-clock timers need a runtime handle
    pub fn for_clock(
        clock: HoldOffClock,
        hold_off_secs: f64,
        sample_rate: f64,
        runtime: Option<(Handle, CancellationToken)>,
    ) -> Self {
        match (clock, runtime) {
            (HoldOffClock::Wall, Some((handle, parent))) => {
                Self::wall_clock(hold_off_secs, handle, parent)
            }
            (HoldOffClock::Wall, None) => {
                log::warn!("No scheduler available for wall-clock hold-off, counting samples instead");
                Self::sample_clock(hold_off_secs, sample_rate)
            }
            (HoldOffClock::Samples, _) => Self::sample_clock(hold_off_secs, sample_rate),
        }
    }

    pub fn duration(&self) -> Duration {
        self.hold_off
    }

    /// Follow a sample clock change; cancels any pending hold-off
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.cancel();
        if let TimerClock::Samples { hold_samples, .. } = &mut self.clock {
            *hold_samples = (self.hold_off.as_secs_f64() * sample_rate).round() as u64;
        }
    }

    /// Start the refractory window at `tick`
    pub fn arm(&mut self, tick: u64) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        match &mut self.clock {
            TimerClock::Samples {
                hold_samples,
                deadline,
            } => {
                if *hold_samples == 0 {
                    *deadline = None;
                    self.active.store(false, Ordering::Release);
                    return;
                }
                *deadline = Some(tick + *hold_samples);
                self.active.store(true, Ordering::Release);
            }
            TimerClock::Wall {
                handle,
                parent,
                current,
            } => {
                if let Some(previous) = current.take() {
                    previous.cancel();
                }
                if self.hold_off.is_zero() {
                    self.active.store(false, Ordering::Release);
                    return;
                }
                self.active.store(true, Ordering::Release);

                let token = parent.child_token();
                *current = Some(token.clone());
                let active = Arc::clone(&self.active);
                let current_generation = Arc::clone(&self.generation);
                let hold_off = self.hold_off;

                handle.spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(hold_off) => {
                            if current_generation.load(Ordering::Acquire) == generation {
                                active.store(false, Ordering::Release);
                            }
                        }
                        _ = token.cancelled() => {}
                    }
                });
            }
        }
    }

    /// Whether the detector is refractory for a chunk starting at `tick`
    pub fn is_active(&mut self, tick: u64) -> bool {
        if let TimerClock::Samples { deadline, .. } = &mut self.clock {
            if let Some(end) = *deadline {
                if tick >= end {
                    *deadline = None;
                    self.active.store(false, Ordering::Release);
                }
            }
        }
        self.active.load(Ordering::Acquire)
    }

    /// Abort a pending hold-off; the detector is immediately free to re-arm
    pub fn cancel(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        match &mut self.clock {
            TimerClock::Samples { deadline, .. } => *deadline = None,
            TimerClock::Wall { current, .. } => {
                if let Some(token) = current.take() {
                    token.cancel();
                }
            }
        }
        self.active.store(false, Ordering::Release);
    }
}

impl Drop for HoldOffTimer {
    fn drop(&mut self) {
        if let TimerClock::Wall {
            current: Some(token),
            ..
        } = &self.clock
        {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_clock_expires_at_deadline() {
        let mut timer = HoldOffTimer::sample_clock(0.05, 3300.0);
        assert!(!timer.is_active(0));
        timer.arm(600);
        assert!(timer.is_active(600));
        assert!(timer.is_active(764));
        assert!(!timer.is_active(765));
        assert!(!timer.is_active(10_000));
    }

    #[test]
    fn test_zero_hold_off_never_blocks() {
        let mut timer = HoldOffTimer::sample_clock(0.0, 1000.0);
        timer.arm(10);
        assert!(!timer.is_active(10));
    }

    #[test]
    fn test_cancel_clears_flag() {
        let mut timer = HoldOffTimer::sample_clock(1.0, 1000.0);
        timer.arm(0);
        assert!(timer.is_active(1));
        timer.cancel();
        assert!(!timer.is_active(1));
    }

    #[tokio::test]
    async fn test_wall_clock_expires() {
        let mut timer =
            HoldOffTimer::wall_clock(0.02, Handle::current(), CancellationToken::new());
        timer.arm(0);
        assert!(timer.is_active(0));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!timer.is_active(0));
    }

    #[tokio::test]
    async fn test_wall_clock_rearm_is_not_cleared_by_stale_timer() {
        let mut timer =
            HoldOffTimer::wall_clock(0.05, Handle::current(), CancellationToken::new());
        timer.arm(0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        timer.cancel();
        timer.arm(0);
        // The first timer would have expired here
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(timer.is_active(0));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!timer.is_active(0));
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_timer() {
        let parent = CancellationToken::new();
        let mut timer = HoldOffTimer::wall_clock(0.02, Handle::current(), parent.clone());
        timer.arm(0);
        parent.cancel();
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Cancelled timers never clear the flag; the owner resets it explicitly
        assert!(timer.is_active(0));
        timer.cancel();
        assert!(!timer.is_active(0));
    }
}
