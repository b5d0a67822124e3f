use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};

/// Source of time for every expiry decision in the workbench.
///
/// Only `now` is required; the remaining operations are expressed in terms of
/// it so that a test clock and the system clock agree on expiry arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_seconds(&self) -> i64 {
        self.now().timestamp()
    }

    fn now_nanos(&self) -> i64 {
        let now = self.now();
        now.timestamp()
            .saturating_mul(1_000_000_000)
            .saturating_add(i64::from(now.timestamp_subsec_nanos()))
    }

    fn add_seconds(&self, seconds: i64) -> DateTime<Utc> {
        self.now() + Duration::seconds(seconds)
    }

    /// True once `at` is reached: an instant equal to now counts as expired.
    fn is_expired(&self, at: DateTime<Utc>) -> bool {
        at <= self.now()
    }

    /// Signed distance to `at`; negative when `at` already passed.
    fn time_until(&self, at: DateTime<Utc>) -> Duration {
        at - self.now()
    }
}

/// Wall clock anchored once and advanced by a monotonic `Instant`, so
/// successive readings never go backwards even if the system time is stepped.
#[derive(Debug)]
pub struct SystemClock {
    anchor_wall: DateTime<Utc>,
    anchor_mono: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor_mono: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.anchor_mono.elapsed();
        match Duration::from_std(elapsed) {
            Ok(delta) => self.anchor_wall + delta,
            Err(_) => Utc::now(),
        }
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn advance_seconds(&self, seconds: i64) {
        self.advance(Duration::seconds(seconds));
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let mut last = clock.now_nanos();
        for _ in 0..1_000 {
            let next = clock.now_nanos();
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn nanos_agree_with_seconds() {
        let clock = SystemClock::new();
        let seconds = clock.now_seconds();
        let nanos = clock.now_nanos();
        let drift = (nanos - seconds * 1_000_000_000).abs();
        assert!(drift < 1_100_000_000, "drift {drift}");
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let clock = ManualClock::starting_now();
        let deadline = clock.add_seconds(5);
        assert!(!clock.is_expired(deadline));
        assert_eq!(clock.time_until(deadline).num_seconds(), 5);

        clock.advance_seconds(5);
        assert!(clock.is_expired(deadline));
        assert_eq!(clock.time_until(deadline).num_seconds(), 0);

        clock.advance_seconds(3);
        assert_eq!(clock.time_until(deadline).num_seconds(), -3);
    }
}
