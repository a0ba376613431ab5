//! Deterministic time.
//!
//! The state machine never reads the wall clock. The leader samples it and
//! commits `Tick` entries; lease and token deadlines are evaluated against the
//! most recently applied tick only.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A committed point in time, in milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tick {
    pub ms: u64,
}

impl Tick {
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    pub const fn zero() -> Self {
        Self { ms: 0 }
    }

    pub const fn add_ms(self, ms: u64) -> Self {
        Self {
            ms: self.ms.saturating_add(ms),
        }
    }

    pub const fn add_secs(self, secs: u64) -> Self {
        self.add_ms(secs.saturating_mul(1000))
    }

    /// Check if this tick is at or after the given deadline.
    pub const fn is_at_or_after(self, deadline: Tick) -> bool {
        self.ms >= deadline.ms
    }

    /// Milliseconds until a deadline, 0 once it has passed.
    pub fn ms_until(self, deadline: Tick) -> u64 {
        deadline.ms.saturating_sub(self.ms)
    }

    /// Whole seconds until a deadline, rounded up.
    pub fn secs_until(self, deadline: Tick) -> u64 {
        self.ms_until(deadline).div_ceil(1000)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tick({}ms)", self.ms)
    }
}

/// Source of wall-clock ticks for the leader's tick emitter.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Tick;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> Tick {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Tick::new(ms)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Tick) -> Self {
        Self {
            ms: AtomicU64::new(start.ms),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, at: Tick) {
        self.ms.store(at.ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        Tick::new(self.ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_arithmetic() {
        let t = Tick::new(1_500);
        assert_eq!(t.add_secs(2), Tick::new(3_500));
        assert!(t.add_ms(1).is_at_or_after(t));
        assert!(!t.is_at_or_after(t.add_ms(1)));
        assert_eq!(t.ms_until(Tick::new(1_000)), 0);
    }

    #[test]
    fn secs_until_rounds_up() {
        let now = Tick::new(10_000);
        assert_eq!(now.secs_until(Tick::new(10_001)), 1);
        assert_eq!(now.secs_until(Tick::new(12_000)), 2);
        assert_eq!(now.secs_until(Tick::new(9_000)), 0);
    }

    #[test]
    fn wall_clock_is_after_epoch() {
        assert!(WallClock.now().ms > 0);
    }

    #[test]
    fn manual_clock_moves_on_request() {
        let clock = ManualClock::new(Tick::new(100));
        clock.advance_ms(50);
        assert_eq!(clock.now(), Tick::new(150));
        clock.set(Tick::new(10));
        assert_eq!(clock.now(), Tick::new(10));
    }
}
