//! Debounce windows.
//!
//! A window opens on the first change of a burst and renders once changes
//! stop for `wait.min`, or at the latest `wait.max` after it opened.

use tokio::time::Instant;

use crate::spec::WaitConfig;

/// An open debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceWindow {
    started: Instant,
    deadline: Instant,
    changes: u32,
}

impl DebounceWindow {
    /// Opens a window for a change observed at `now`.
    pub fn open(now: Instant, wait: &WaitConfig) -> Self {
        Self {
            started: now,
            deadline: now + wait.min(),
            changes: 1,
        }
    }

    /// Records another change observed at `now`.
    ///
    /// The deadline moves to `now + min` but never past `started + max`,
    /// and never backwards.
    pub fn extend(&mut self, now: Instant, wait: &WaitConfig) {
        let quiet = now + wait.min();
        let cap = self.started + wait.max();
        self.deadline = self.deadline.max(quiet.min(cap));
        self.changes = self.changes.saturating_add(1);
    }

    /// Whether the window has elapsed at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// When the window opened.
    pub const fn started(&self) -> Instant {
        self.started
    }

    /// When the template should render.
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Changes folded into this window.
    pub const fn changes(&self) -> u32 {
        self.changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn wait(min: u64, max: u64) -> WaitConfig {
        WaitConfig::new(Duration::from_millis(min), Some(Duration::from_millis(max)))
            .expect("valid")
    }

    #[test]
    fn test_isolated_change_is_due_at_min() {
        let t0 = Instant::now();
        let window = DebounceWindow::open(t0, &wait(2000, 10_000));
        assert!(!window.is_due(t0 + Duration::from_millis(1999)));
        assert!(window.is_due(t0 + Duration::from_millis(2000)));
    }

    #[test]
    fn test_change_pushes_deadline() {
        let t0 = Instant::now();
        let w = wait(2000, 10_000);
        let mut window = DebounceWindow::open(t0, &w);
        window.extend(t0 + Duration::from_secs(1), &w);
        assert_eq!(window.deadline(), t0 + Duration::from_secs(3));
        assert_eq!(window.changes(), 2);
    }

    #[test]
    fn test_steady_stream_is_capped_at_max() {
        let t0 = Instant::now();
        let w = wait(2000, 10_000);
        let mut window = DebounceWindow::open(t0, &w);
        for step in 1..=20 {
            window.extend(t0 + Duration::from_millis(step * 900), &w);
        }
        assert_eq!(window.deadline(), t0 + Duration::from_secs(10));
        assert!(window.is_due(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_zero_wait_is_due_immediately() {
        let t0 = Instant::now();
        let window = DebounceWindow::open(t0, &WaitConfig::IMMEDIATE);
        assert!(window.is_due(t0));
    }

    proptest! {
        #[test]
        fn deadline_stays_within_bounds(
            min in 0u64..5_000,
            extra in 0u64..20_000,
            gaps in prop::collection::vec(0u64..3_000, 0..30),
        ) {
            let w = wait(min, min + extra);
            let t0 = Instant::now();
            let mut window = DebounceWindow::open(t0, &w);
            let mut now = t0;
            let mut previous = window.deadline();

            for gap in gaps {
                now += Duration::from_millis(gap);
                if window.is_due(now) {
                    break;
                }
                window.extend(now, &w);
                prop_assert!(window.deadline() >= previous);
                prop_assert!(window.deadline() <= t0 + w.max());
                prop_assert!(window.deadline() >= t0 + w.min());
                previous = window.deadline();
            }
        }
    }
}
