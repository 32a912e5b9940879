//! Calendar-day source.
//!
//! Every "today" in the crate comes from a [`Clock`], so streaks, cheat days
//! and step rollover all agree on the device's local calendar date and tests
//! can pin it.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Local, NaiveDate, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar date in the device's local timezone.
    fn today(&self) -> NaiveDate;
}

/// Wall clock; `today` is the local date, normalized to local midnight.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Settable clock for tests and replays. `today` is independent of `now` so a
/// test can move the calendar date without caring about timezones.
#[derive(Debug)]
pub struct FixedClock {
    inner: Mutex<(DateTime<Utc>, NaiveDate)>,
}

impl FixedClock {
    #[must_use]
    pub fn new(today: NaiveDate) -> Self {
        let now = today
            .and_hms_opt(12, 0, 0)
            .map_or_else(Utc::now, |dt| dt.and_utc());
        Self {
            inner: Mutex::new((now, today)),
        }
    }

    pub fn set_today(&self, today: NaiveDate) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.1 = today;
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.0 = now;
    }

    pub fn advance_days(&self, days: i64) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.0 += chrono::Duration::days(days);
        guard.1 += chrono::Duration::days(days);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    fn today(&self) -> NaiveDate {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock_advances_both_fields() {
        let clock = FixedClock::new(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
        let before = clock.now();
        clock.advance_days(1);
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(clock.now() - before, chrono::Duration::days(1));
    }
}
