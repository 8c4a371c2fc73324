//! Commit timestamps
//!
//! Timestamps are microseconds since Unix epoch. They are used only to break
//! ties between commits (choosing the "left" and "right" merge inputs, and
//! ordering heads); causal order always comes from the parent pointers.
//!
//! Each page storage owns a [`MonotonicClock`] so commits created on one
//! device are strictly ordered even when the wall clock stalls or steps back.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Microsecond-precision timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Unix epoch; the timestamp of every page's root commit
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Read the wall clock
    ///
    /// Returns epoch if the system clock is before Unix epoch.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as u64)
    }

    /// Create a timestamp from microseconds since epoch
    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    /// Microseconds since epoch
    #[inline]
    pub const fn as_micros(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0 / 1_000_000;
        let micros = self.0 % 1_000_000;
        write!(f, "{}.{:06}", secs, micros)
    }
}

impl From<u64> for Timestamp {
    fn from(micros: u64) -> Self {
        Timestamp::from_micros(micros)
    }
}

/// Strictly increasing timestamp source
///
/// `tick()` returns `max(wall_clock, last + 1)`, so two calls never return
/// the same value. `observe()` folds in timestamps received from peers.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    /// Create a clock that has not issued any timestamp yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next timestamp
    pub fn tick(&self) -> Timestamp {
        let wall = Timestamp::now().as_micros();
        let mut current = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(current.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Timestamp(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Ensure later ticks are greater than a timestamp seen elsewhere
    pub fn observe(&self, seen: Timestamp) {
        self.last.fetch_max(seen.as_micros(), Ordering::AcqRel);
    }
}
