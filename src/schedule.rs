//! Wall-clock tick alignment for the collection loop.
//!
//! Ticks are multiples of the interval counted from the Unix epoch, so a
//! 300 s interval fires at :00, :05, :10, ... regardless of when the process
//! started. On-time cycles advance by exactly one interval; a cycle that
//! overruns its tick resynchronizes to the next boundary after "now" instead
//! of queueing catch-up cycles.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// What the loop should do before the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Sleep for `duration`, then run the cycle for tick `until`
    Sleep {
        until: DateTime<Utc>,
        duration: Duration,
    },

    /// The tick `missed` has already passed; run the cycle immediately
    Overrun { missed: DateTime<Utc> },
}

/// Smallest multiple of `interval` (from the epoch) strictly after `now`.
///
/// Intervals below one second are treated as one second.
pub fn first_tick_after(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = interval_secs(interval);
    // Flooring to whole seconds keeps the result strictly after `now`.
    let tick = now
        .timestamp()
        .div_euclid(step)
        .saturating_add(1)
        .saturating_mul(step);
    DateTime::<Utc>::from_timestamp(tick, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn interval_secs(interval: Duration) -> i64 {
    i64::try_from(interval.as_secs()).unwrap_or(i64::MAX).max(1)
}

/// Next scheduled tick plus the interval it advances by.
#[derive(Debug, Clone)]
pub struct CycleClock {
    interval: Duration,
    next_tick: DateTime<Utc>,
}

impl CycleClock {
    /// Schedule the first tick after `now`.
    pub fn new(interval: Duration, now: DateTime<Utc>) -> Self {
        Self {
            interval,
            next_tick: first_tick_after(now, interval),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_tick(&self) -> DateTime<Utc> {
        self.next_tick
    }

    /// Decide how to reach the next cycle and advance the schedule.
    ///
    /// Before the tick: sleep until it and schedule `tick + interval`.
    /// At or past the tick: run now and schedule the first tick after `now`.
    pub fn plan(&mut self, now: DateTime<Utc>) -> Wait {
        let tick = self.next_tick;
        if now < tick {
            self.next_tick = tick
                .checked_add_signed(TimeDelta::seconds(interval_secs(self.interval)))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            Wait::Sleep {
                until: tick,
                duration: (tick - now).to_std().unwrap_or_default(),
            }
        } else {
            self.next_tick = first_tick_after(now, self.interval);
            Wait::Overrun { missed: tick }
        }
    }
}
