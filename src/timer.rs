//! Single-slot advance timer.
//!
//! The scheduler owns exactly one of these. Arming replaces whatever was
//! pending, so a stale deadline can never fire after a manual skip.

use std::future::pending;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Stand-in deadline for slots too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// What the pending deadline will do when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// Start the back surface's media ahead of the swap.
    Preroll,
    /// Swap surfaces and move to the next item.
    Advance,
}

#[derive(Debug, Default)]
pub struct AdvanceTimer {
    armed: Option<(Instant, TimerPhase)>,
    frozen: Option<(Duration, TimerPhase)>,
}

impl AdvanceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm for `after`, replacing any pending or frozen deadline.
    pub fn arm(&mut self, after: Duration, phase: TimerPhase) {
        self.frozen = None;
        self.armed = Some((deadline_after(after), phase));
    }

    /// Arm for an item occupying `slot`, firing a pre-roll phase first when
    /// `preroll` is non-zero and shorter than the slot.
    pub fn arm_slot(&mut self, slot: Duration, preroll: Duration) {
        if !preroll.is_zero() && preroll < slot {
            self.arm(slot - preroll, TimerPhase::Preroll);
        } else {
            self.arm(slot, TimerPhase::Advance);
        }
    }

    pub fn cancel(&mut self) {
        self.armed = None;
        self.frozen = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.armed.map(|(at, _)| at)
    }

    /// Time left until the pending deadline fires.
    pub fn remaining(&self) -> Option<Duration> {
        match (self.armed, self.frozen) {
            (Some((at, _)), _) => Some(at.saturating_duration_since(Instant::now())),
            (None, Some((left, _))) => Some(left),
            (None, None) => None,
        }
    }

    /// Consume the deadline once it has passed.
    pub fn fire(&mut self) -> Option<TimerPhase> {
        self.armed.take().map(|(_, phase)| phase)
    }

    /// Stop the clock, keeping the time left.
    pub fn freeze(&mut self) {
        if let Some((at, phase)) = self.armed.take() {
            self.frozen = Some((at.saturating_duration_since(Instant::now()), phase));
        }
    }

    /// Restart a frozen clock. Returns false when nothing was frozen.
    pub fn thaw(&mut self) -> bool {
        match self.frozen.take() {
            Some((left, phase)) => {
                self.armed = Some((deadline_after(left), phase));
                true
            }
            None => false,
        }
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_arm_replaces_previous_deadline() {
        let mut timer = AdvanceTimer::new();
        timer.arm(Duration::from_secs(10), TimerPhase::Advance);
        timer.arm(Duration::from_secs(2), TimerPhase::Advance);

        let start = Instant::now();
        sleep_until_opt(timer.deadline()).await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(timer.fire(), Some(TimerPhase::Advance));
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_and_thaw_keep_remaining_time() {
        let mut timer = AdvanceTimer::new();
        timer.arm(Duration::from_secs(10), TimerPhase::Advance);

        tokio::time::sleep(Duration::from_secs(4)).await;
        timer.freeze();
        assert!(!timer.is_armed());
        assert_eq!(timer.remaining(), Some(Duration::from_secs(6)));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(timer.thaw());
        assert_eq!(timer.remaining(), Some(Duration::from_secs(6)));
        assert!(!timer.thaw());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_slot_splits_preroll() {
        let mut timer = AdvanceTimer::new();
        timer.arm_slot(Duration::from_secs(10), Duration::from_millis(500));
        assert_eq!(timer.remaining(), Some(Duration::from_millis(9_500)));
        assert_eq!(timer.fire(), Some(TimerPhase::Preroll));

        // Pre-roll longer than the slot is ignored.
        timer.arm_slot(Duration::from_secs(1), Duration::from_secs(2));
        assert_eq!(timer.fire(), Some(TimerPhase::Advance));

        timer.arm_slot(Duration::from_secs(5), Duration::ZERO);
        assert_eq!(timer.remaining(), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_deadline_saturates() {
        let mut timer = AdvanceTimer::new();
        timer.arm(Duration::MAX, TimerPhase::Advance);
        assert!(timer.is_armed());
        assert!(timer.remaining().unwrap() >= FAR_FUTURE);

        timer.freeze();
        assert!(timer.thaw());
        assert!(timer.is_armed());
    }

    #[test]
    fn test_cancel_clears_frozen_state() {
        let mut timer = AdvanceTimer::new();
        timer.frozen = Some((Duration::from_secs(3), TimerPhase::Advance));
        timer.cancel();
        assert!(!timer.is_frozen());
        assert_eq!(timer.remaining(), None);
    }
}
