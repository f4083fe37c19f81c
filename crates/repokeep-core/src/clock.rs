//! Wall-clock and calendar policy seams.
//!
//! Backup type selection and retention both depend on "today". Both take the
//! time from a `Clock` and the weekly rule from a `WeeklyDayPolicy` so tests
//! can pin them.
//!
//! Instants are UTC. The calendar date ("today", the weekly day, per-day step
//! markers) is the host's local date, so `weekly_full_day: sun` means the
//! local Sunday.

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Utc, Weekday};

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar date of `now`. UTC unless the clock knows a local zone.
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// The calendar date of `instant` in `zone`.
pub fn local_date<Tz: TimeZone>(instant: DateTime<Utc>, zone: &Tz) -> NaiveDate {
    instant.with_timezone(zone).date_naive()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        local_date(self.now(), &Local)
    }
}

/// A clock stopped at a single instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Decides whether a date is the designated weekly full-backup day.
pub trait WeeklyDayPolicy {
    fn is_designated(&self, date: NaiveDate) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklySchedule {
    pub day: Weekday,
}

impl WeeklySchedule {
    pub fn new(day: Weekday) -> Self {
        Self { day }
    }
}

impl Default for WeeklySchedule {
    fn default() -> Self {
        Self { day: Weekday::Sun }
    }
}

impl WeeklyDayPolicy for WeeklySchedule {
    fn is_designated(&self, date: NaiveDate) -> bool {
        date.weekday() == self.day
    }
}

/// Lowercase three-letter weekday name used in snapshot tags.
pub fn weekday_tag(date: NaiveDate) -> String {
    date.weekday().to_string().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn weekly_schedule_matches_only_its_day() {
        let policy = WeeklySchedule::new(Weekday::Sun);
        // 2026-10-18 is a Sunday
        let sunday = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert!(policy.is_designated(sunday));
        assert!(!policy.is_designated(sunday.succ_opt().unwrap()));
    }

    #[test]
    fn fixed_clock_today() {
        let clock = FixedClock(Utc.with_ymd_and_hms(2026, 10, 15, 23, 59, 0).unwrap());
        assert_eq!(clock.today(), NaiveDate::from_ymd_opt(2026, 10, 15).unwrap());
        assert_eq!(weekday_tag(clock.today()), "thu");
    }

    #[test]
    fn weekly_day_follows_the_local_calendar() {
        // 02:00 UTC on Sunday is still Saturday evening in UTC-5.
        let instant = Utc.with_ymd_and_hms(2026, 10, 18, 2, 0, 0).unwrap();
        let policy = WeeklySchedule::new(Weekday::Sun);
        let west = FixedOffset::west_opt(5 * 3600).unwrap();
        let east = FixedOffset::east_opt(9 * 3600).unwrap();

        let saturday = local_date(instant, &west);
        assert_eq!(saturday, NaiveDate::from_ymd_opt(2026, 10, 17).unwrap());
        assert!(!policy.is_designated(saturday));
        assert!(policy.is_designated(local_date(instant, &east)));
        assert!(policy.is_designated(local_date(instant, &Utc)));
    }
}
