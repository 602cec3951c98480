// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

/// A countdown timer embedded in routing state.
///
/// The engine has no clock of its own. Timers only move when the aging pass
/// calls `tick` with the time elapsed since the previous pass, so a timer
/// dies with the entry that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    /// How long a timer runs until it fires.
    pub interval: Duration,

    /// How much time is left.
    remaining: Duration,

    /// Only enabled timers can expire.
    enabled: bool,
}

impl Timer {
    /// Create a disabled timer with the specified interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            remaining: interval,
            enabled: false,
        }
    }

    pub fn from_secs(secs: u16) -> Self {
        Self::new(Duration::from_secs(secs.into()))
    }

    /// Create an enabled timer that expires after `interval`.
    pub fn armed(interval: Duration) -> Self {
        let mut t = Self::new(interval);
        t.enabled = true;
        t
    }

    /// Decrement the remaining time by `elapsed`, saturating at zero.
    pub fn tick(&mut self, elapsed: Duration) {
        if self.enabled {
            self.remaining = self.remaining.saturating_sub(elapsed);
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true
    }

    pub fn disable(&mut self) {
        self.enabled = false
    }

    /// True if the timer is enabled and has ticked down to zero.
    pub fn expired(&self) -> bool {
        self.enabled && self.remaining.is_zero()
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    /// Reset the remaining time to the timer's interval.
    pub fn reset(&mut self) {
        self.remaining = self.interval;
    }

    /// Set a new interval, reset and enable.
    pub fn arm(&mut self, interval: Duration) {
        self.interval = interval;
        self.remaining = interval;
        self.enabled = true;
    }

    /// Expire the timer so the next aging pass acts on it.
    pub fn fire(&mut self) {
        self.remaining = Duration::ZERO;
        self.enabled = true;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timer_lifecycle() {
        let mut t = Timer::from_secs(10);
        t.tick(Duration::from_secs(20));
        assert!(!t.expired(), "disabled timers do not run");

        t.enable();
        t.tick(Duration::from_secs(5));
        assert_eq!(t.remaining(), Duration::from_secs(5));
        t.tick(Duration::from_secs(6));
        assert!(t.expired());

        t.reset();
        assert!(!t.expired());
        t.fire();
        assert!(t.expired());

        t.arm(Duration::from_secs(3));
        assert_eq!(t.interval, Duration::from_secs(3));
        assert!(!t.expired());
        t.disable();
        t.tick(Duration::from_secs(3));
        assert!(!t.expired());
    }
}
