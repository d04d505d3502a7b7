//! Injected environment dependencies.
//!
//! Time is the only ambient dependency the synchronization layer has. It is
//! abstracted behind [`Clock`] so tests can pin or advance it explicitly.

use chrono::{DateTime, SubsecRound, Utc};

/// Clock trait - abstracts time operations for testability.
///
/// # Examples
///
/// ```
/// use gavel_core::environment::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let first = clock.now();
/// let second = clock.now();
/// assert!(second >= first);
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time, truncated to microseconds.
///
/// Postgres `TIMESTAMPTZ` stores microseconds. Truncating at the source keeps
/// a timestamp identical after a database or JSON round trip, which the
/// strictly-newer comparison on the read side depends on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_micros(Utc::now())
    }
}

/// Drop sub-microsecond precision from a timestamp.
#[must_use]
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn system_clock_has_microsecond_precision() {
        let now = SystemClock.now();
        assert_eq!(now.nanosecond() % 1_000, 0);
    }
}
