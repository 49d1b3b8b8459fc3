//! Daily wall-clock schedule for the cleanup job.
//!
//! Pure time arithmetic on naive local timestamps; the caller supplies "now".

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, NaiveTime, TimeDelta};

/// A job that fires once per calendar day at a fixed local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl DailySchedule {
    /// Parse `HH:MM` or `HH:MM:SS`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let at = NaiveTime::parse_from_str(raw, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
            .with_context(|| format!("invalid time of day '{raw}' (expected HH:MM)"))?;
        Ok(Self { at })
    }

    pub fn at(&self) -> NaiveTime {
        self.at
    }

    /// First occurrence of the configured time strictly after `now`.
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.at);
        if today > now {
            today
        } else {
            today + TimeDelta::days(1)
        }
    }
}

/// Schedule plus the next due timestamp.
///
/// Missed occurrences are never caught up: a poll that finds the job overdue
/// fires once and moves `next_run` past `now`.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    schedule: DailySchedule,
    next_run: NaiveDateTime,
}

impl ScheduleState {
    pub fn new(schedule: DailySchedule, now: NaiveDateTime) -> Self {
        Self {
            schedule,
            next_run: schedule.next_after(now),
        }
    }

    pub fn next_run(&self) -> NaiveDateTime {
        self.next_run
    }

    /// Returns `true` when the job is due at `now`, rescheduling it.
    pub fn poll(&mut self, now: NaiveDateTime) -> bool {
        if now < self.next_run {
            return false;
        }
        self.next_run = self.schedule.next_after(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(hh, mm, ss))
            .expect("valid timestamp")
    }

    #[test]
    fn parse_accepts_minutes_and_seconds() {
        let short = DailySchedule::parse("23:59").expect("parse");
        let long = DailySchedule::parse("23:59:00").expect("parse");
        assert_eq!(short, long);
        assert!(DailySchedule::parse("25:00").is_err());
        assert!(DailySchedule::parse("noon").is_err());
    }

    #[test]
    fn next_after_is_strictly_later() {
        let schedule = DailySchedule::parse("23:59").expect("parse");
        assert_eq!(
            schedule.next_after(at(2023, 1, 1, 10, 0, 0)),
            at(2023, 1, 1, 23, 59, 0)
        );
        assert_eq!(
            schedule.next_after(at(2023, 1, 1, 23, 59, 0)),
            at(2023, 1, 2, 23, 59, 0)
        );
        assert_eq!(
            schedule.next_after(at(2023, 1, 1, 23, 59, 30)),
            at(2023, 1, 2, 23, 59, 0)
        );
    }

    #[test]
    fn fires_once_per_day_for_any_poll_cadence() {
        let schedule = DailySchedule::parse("23:59").expect("parse");
        for step_secs in [1i64, 7, 13, 59, 61] {
            let start = at(2023, 1, 1, 0, 0, 0);
            let end = at(2023, 1, 4, 0, 0, 0);
            let mut state = ScheduleState::new(schedule, start);
            let mut fired: BTreeMap<NaiveDate, Vec<NaiveDateTime>> = BTreeMap::new();

            let mut now = start;
            while now < end {
                if state.poll(now) {
                    fired.entry(now.date()).or_default().push(now);
                }
                now += TimeDelta::seconds(step_secs);
            }

            assert_eq!(fired.len(), 3, "step {step_secs}s: {fired:?}");
            for (day, firings) in &fired {
                assert_eq!(firings.len(), 1, "step {step_secs}s on {day}");
                let late = firings[0] - day.and_time(schedule.at());
                assert!(late >= TimeDelta::zero());
                assert!(late < TimeDelta::seconds(step_secs), "step {step_secs}s");
            }
        }
    }

    #[test]
    fn missed_days_are_skipped_not_caught_up() {
        let schedule = DailySchedule::parse("23:59").expect("parse");
        let mut state = ScheduleState::new(schedule, at(2023, 1, 1, 12, 0, 0));

        assert!(state.poll(at(2023, 1, 4, 8, 0, 0)));
        assert_eq!(state.next_run(), at(2023, 1, 4, 23, 59, 0));
        assert!(!state.poll(at(2023, 1, 4, 8, 0, 1)));
    }

    #[test]
    fn registration_at_the_exact_time_waits_a_day() {
        let schedule = DailySchedule::parse("23:59").expect("parse");
        let mut state = ScheduleState::new(schedule, at(2023, 1, 1, 23, 59, 0));
        assert!(!state.poll(at(2023, 1, 1, 23, 59, 30)));
        assert_eq!(state.next_run(), at(2023, 1, 2, 23, 59, 0));
    }
}
