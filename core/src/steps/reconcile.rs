//! Pure step reconciliation state.
//!
//! Sensor readings are session-relative: a counter that starts at some
//! arbitrary value and may reset underneath us. Only positive differences
//! between consecutive readings are added to the day's total, and merges with
//! the persisted and cached totals take the maximum, so the total for a given
//! day never goes down.

use chrono::NaiveDate;

use crate::error::ReconciliationConflict;

/// What a single sensor reading did to the running total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First reading after a rollover; it only sets the baseline.
    Baseline,
    Delta(i64),
    /// The session counter went backwards. Re-baselined, nothing added.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReconciler {
    date: NaiveDate,
    baseline: Option<i64>,
    running_total: i64,
}

impl StepReconciler {
    #[must_use]
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            baseline: None,
            running_total: 0,
        }
    }

    #[must_use]
    pub fn date(&self) -> NaiveDate {
        self.date
    }

    #[must_use]
    pub fn running_total(&self) -> i64 {
        self.running_total
    }

    #[must_use]
    pub fn baseline(&self) -> Option<i64> {
        self.baseline
    }

    /// A fresh sensor session counts from zero.
    pub fn start_session(&mut self) {
        self.baseline = Some(0);
    }

    pub fn observe(&mut self, reading: i64) -> Observation {
        let Some(base) = self.baseline else {
            self.baseline = Some(reading);
            return Observation::Baseline;
        };
        self.baseline = Some(reading);
        let delta = reading - base;
        if delta < 0 {
            Observation::Reset
        } else {
            self.running_total += delta;
            Observation::Delta(delta)
        }
    }

    /// Max-merge with the persisted and cached totals for the current day.
    /// Returns a conflict for each source that overtook a live running total.
    pub fn merge(
        &mut self,
        persisted: Option<i64>,
        cache: Option<i64>,
    ) -> Vec<ReconciliationConflict> {
        let mut conflicts = Vec::new();
        for (source_name, value) in [("persisted", persisted), ("cache", cache)] {
            let Some(value) = value else { continue };
            if value > self.running_total {
                if self.running_total > 0 {
                    conflicts.push(ReconciliationConflict {
                        source_name,
                        reported: value,
                        running_total: self.running_total,
                    });
                }
                self.running_total = value;
            }
        }
        conflicts
    }

    /// Adopt a lower total the user set explicitly.
    pub fn accept_correction(&mut self, total: i64) {
        self.running_total = total.max(0);
    }

    /// Moves to `today` if the calendar date has advanced. Returns the day
    /// that just finished with its final total. The next reading becomes the
    /// new baseline.
    pub fn roll_over(&mut self, today: NaiveDate) -> Option<(NaiveDate, i64)> {
        if today <= self.date {
            return None;
        }
        let finished = (self.date, self.running_total);
        self.date = today;
        self.running_total = 0;
        self.baseline = None;
        Some(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    #[test]
    fn test_session_reset_never_drops_total() {
        let mut r = StepReconciler::new(today());
        r.start_session();
        assert_eq!(r.observe(120), Observation::Delta(120));
        assert_eq!(r.running_total(), 120);

        // Platform counter reset: new session baseline lower than before.
        assert_eq!(r.observe(10), Observation::Reset);
        assert_eq!(r.running_total(), 120);

        assert_eq!(r.observe(60), Observation::Delta(50));
        assert_eq!(r.running_total(), 170);
    }

    #[test]
    fn test_merge_takes_maximum() {
        let mut r = StepReconciler::new(today());
        assert!(r.merge(Some(4000), Some(3500)).is_empty());
        assert_eq!(r.running_total(), 4000);

        r.start_session();
        r.observe(100);
        assert_eq!(r.running_total(), 4100);

        // A stale lower value changes nothing.
        assert!(r.merge(Some(4000), None).is_empty());
        assert_eq!(r.running_total(), 4100);

        let conflicts = r.merge(None, Some(5000));
        assert_eq!(
            conflicts,
            vec![ReconciliationConflict {
                source_name: "cache",
                reported: 5000,
                running_total: 4100,
            }]
        );
        assert_eq!(r.running_total(), 5000);
    }

    #[test]
    fn test_roll_over_resets_and_rebaselines() {
        let mut r = StepReconciler::new(today());
        r.start_session();
        r.observe(900);
        let tomorrow = today().succ_opt().unwrap();

        assert_eq!(r.roll_over(today()), None);
        assert_eq!(r.roll_over(tomorrow), Some((today(), 900)));
        assert_eq!(r.running_total(), 0);
        assert_eq!(r.date(), tomorrow);

        // The session keeps counting across midnight; the first reading of
        // the new day is only a baseline.
        assert_eq!(r.observe(950), Observation::Baseline);
        assert_eq!(r.observe(1000), Observation::Delta(50));
        assert_eq!(r.running_total(), 50);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reading(i64),
        Merge(Option<i64>, Option<i64>),
        NewSession,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0i64..50_000).prop_map(Op::Reading),
            1 => (proptest::option::of(0i64..50_000), proptest::option::of(0i64..50_000))
                .prop_map(|(p, c)| Op::Merge(p, c)),
            1 => Just(Op::NewSession),
        ]
    }

    proptest! {
        #[test]
        fn prop_total_never_decreases_within_a_day(ops in proptest::collection::vec(op(), 0..200)) {
            let mut r = StepReconciler::new(today());
            r.start_session();
            let mut last = r.running_total();
            for op in ops {
                match op {
                    Op::Reading(v) => { r.observe(v); }
                    Op::Merge(p, c) => { r.merge(p, c); }
                    Op::NewSession => r.start_session(),
                }
                prop_assert!(r.running_total() >= last);
                last = r.running_total();
            }
        }
    }
}
