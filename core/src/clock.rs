//! Wall-clock seam and calendar-month arithmetic.

use chrono::{DateTime, Datelike, Duration, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::fmt;

/// Source of the current time
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Moves the clock to `now`
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Moves the clock forward by `by`
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Whole calendar months from `start` to `end`, evaluated in `tz`.
///
/// A month only counts once the day of month has been reached again, so a
/// start on Jan 31 yields 0 on Feb 28 and 1 on Mar 1. Never negative.
pub fn months_elapsed(start: DateTime<Utc>, end: DateTime<Utc>, tz: Tz) -> u32 {
    let start = start.with_timezone(&tz).date_naive();
    let end = end.with_timezone(&tz).date_naive();

    let mut months = (end.year() - start.year()) * 12 + end.month() as i32 - start.month() as i32;
    if end.day() < start.day() {
        months -= 1;
    }

    months.max(0) as u32
}
