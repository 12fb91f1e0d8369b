//! Time calculator — maps a schedule and "now" to the next trigger instant.
//!
//! Everything here is pure: no I/O, no clock reads. All wall-clock rules are
//! evaluated in one configured timezone and the result is returned in UTC.
//! A result is always strictly after `now`; `None` means "do not schedule".

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use memocue_core::types::{Schedule, TimeOfDay};

use crate::cron;

/// Next-trigger calculator bound to a timezone.
#[derive(Debug, Clone, Copy)]
pub struct TimeCalculator {
    tz: Tz,
}

impl TimeCalculator {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Next instant strictly after `now` at which `schedule` fires.
    pub fn next_trigger(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        last_push_at: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let next = match schedule {
            Schedule::Once { at } => Some(*at),
            Schedule::Hourly {
                minute,
                start_hour,
                end_hour,
            } => self.hourly(*minute, *start_hour, *end_hour, now),
            Schedule::Daily { times } => self.daily(times, now),
            Schedule::Weekly { days, time } => self.weekly(days, *time, now),
            Schedule::Monthly { days, time } => self.monthly(days, *time, now),
            Schedule::MonthlyInterval {
                interval,
                first_date,
                time,
            } => self.monthly_interval(*interval, *first_date, *time, now),
            Schedule::Interval { minutes } => interval(*minutes, now, last_push_at),
            Schedule::Workdays { times } => {
                self.filtered_days(times, now, |wd| (1..=5).contains(&wd))
            }
            Schedule::Weekend { times } => {
                self.filtered_days(times, now, |wd| wd == 0 || wd == 6)
            }
            Schedule::Cron { expression } => cron::next_after(expression, now, self.tz),
            Schedule::Custom { dates } => dates.iter().copied().filter(|d| *d > now).min(),
        };
        next.filter(|t| *t > now)
    }

    fn hourly(
        &self,
        minute: u32,
        start_hour: Option<u32>,
        end_hour: Option<u32>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let start = start_hour.unwrap_or(0);
        let end = end_hour.unwrap_or(23);
        if minute > 59 || start > 23 || end > 23 {
            tracing::warn!(
                "Invalid hourly schedule: minute={} window={}..={}",
                minute,
                start,
                end
            );
            return None;
        }

        let local = now.with_timezone(&self.tz).naive_local();
        let mut candidate = local
            .date()
            .and_hms_opt(local.hour(), minute, 0)?;
        if candidate <= local {
            candidate += Duration::hours(1);
        }

        let hour = candidate.hour();
        if hour < start {
            candidate = candidate.date().and_hms_opt(start, minute, 0)?;
        } else if hour > end {
            candidate = candidate.date().succ_opt()?.and_hms_opt(start, minute, 0)?;
        }
        self.resolve(candidate)
    }

    fn daily(&self, times: &[TimeOfDay], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if times.is_empty() {
            tracing::warn!("Daily schedule has no times");
            return None;
        }
        let today = self.local_date(now);
        [today, today.succ_opt()?]
            .into_iter()
            .flat_map(|date| times.iter().filter_map(move |t| self.at_local(date, t.as_naive())))
            .filter(|t| *t > now)
            .min()
    }

    fn weekly(&self, days: &[u32], time: TimeOfDay, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !days.iter().any(|d| *d <= 6) {
            tracing::warn!("Weekly schedule has no valid weekdays: {:?}", days);
            return None;
        }
        self.scan_week(now, |date| {
            days.contains(&date.weekday().num_days_from_sunday())
                .then(|| self.at_local(date, time.as_naive()))
                .flatten()
        })
    }

    fn filtered_days<F>(&self, times: &[TimeOfDay], now: DateTime<Utc>, matches: F) -> Option<DateTime<Utc>>
    where
        F: Fn(u32) -> bool,
    {
        if times.is_empty() {
            tracing::warn!("Day-filtered schedule has no times");
            return None;
        }
        let mut sorted = times.to_vec();
        sorted.sort();
        self.scan_week(now, |date| {
            if !matches(date.weekday().num_days_from_sunday()) {
                return None;
            }
            sorted
                .iter()
                .filter_map(|t| self.at_local(date, t.as_naive()))
                .find(|t| *t > now)
        })
    }

    /// Walk today plus the following 7 days and return the first future hit.
    fn scan_week<F>(&self, now: DateTime<Utc>, candidate: F) -> Option<DateTime<Utc>>
    where
        F: Fn(NaiveDate) -> Option<DateTime<Utc>>,
    {
        let today = self.local_date(now);
        (0..=7)
            .filter_map(|offset| today.checked_add_signed(Duration::days(offset)))
            .filter_map(candidate)
            .find(|t| *t > now)
    }

    fn monthly(&self, days: &[u32], time: TimeOfDay, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut valid: Vec<u32> = days.iter().copied().filter(|d| (1..=31).contains(d)).collect();
        if valid.is_empty() {
            tracing::warn!("Monthly schedule has no valid days: {:?}", days);
            return None;
        }
        valid.sort_unstable();
        valid.dedup();

        let today = self.local_date(now);
        // Any day in 1..=31 exists at least once in every two consecutive months.
        for offset in 0..=2 {
            let (year, month) = add_months(today.year(), today.month(), offset);
            let last = last_day_of_month(year, month)?;
            let hit = valid
                .iter()
                .filter(|d| **d <= last)
                .filter_map(|d| NaiveDate::from_ymd_opt(year, month, *d))
                .filter_map(|date| self.at_local(date, time.as_naive()))
                .find(|t| *t > now);
            if hit.is_some() {
                return hit;
            }
        }
        None
    }

    fn monthly_interval(
        &self,
        interval: u32,
        first_date: NaiveDate,
        time: TimeOfDay,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if interval == 0 {
            tracing::warn!("Monthly-interval schedule with interval 0");
            return None;
        }
        let first = self.at_local(first_date, time.as_naive())?;
        if first > now {
            return Some(first);
        }

        let today = self.local_date(now);
        let months_diff = (today.year() - first_date.year()) * 12 + today.month() as i32
            - first_date.month() as i32;
        let step = interval as i32;
        let cycle = months_diff.max(0) / step;

        // The current cycle's occurrence may still be ahead later this month.
        (cycle..=cycle + 2)
            .filter_map(|k| self.cycle_occurrence(first_date, time, k * step))
            .find(|t| *t > now)
    }

    /// The anchor moved forward `months`, day clamped to the month's last day.
    fn cycle_occurrence(&self, anchor: NaiveDate, time: TimeOfDay, months: i32) -> Option<DateTime<Utc>> {
        let (year, month) = add_months(anchor.year(), anchor.month(), months);
        let day = anchor.day().min(last_day_of_month(year, month)?);
        self.at_local(NaiveDate::from_ymd_opt(year, month, day)?, time.as_naive())
    }

    fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    fn at_local(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        self.resolve(date.and_time(time))
    }

    /// Local wall-clock time to UTC. Ambiguous times take the earlier
    /// instant; times inside a DST gap move forward one hour.
    fn resolve(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.tz
            .from_local_datetime(&local)
            .earliest()
            .or_else(|| self.tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
            .map(|t| t.with_timezone(&Utc))
    }
}

fn interval(minutes: u32, now: DateTime<Utc>, last_push_at: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    if minutes == 0 {
        tracing::warn!("Interval schedule with 0 minutes");
        return None;
    }
    let step = Duration::minutes(minutes as i64);
    let next = last_push_at.unwrap_or(now) + step;
    if next > now { Some(next) } else { Some(now + step) }
}

fn add_months(year: i32, month: u32, months: i32) -> (i32, u32) {
    let total = year * 12 + month as i32 - 1 + months;
    (total.div_euclid(12), total.rem_euclid(12) as u32 + 1)
}

fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = add_months(year, month, 1);
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|d| d.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Shanghai;
    use std::collections::BTreeSet;

    fn calc() -> TimeCalculator {
        TimeCalculator::new(Shanghai)
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn tod(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    #[test]
    fn test_once() {
        let now = at("2024-01-01T10:00:00+08:00");
        let future = Schedule::Once { at: at("2024-01-01T10:00:01+08:00") };
        let past = Schedule::Once { at: at("2024-01-01T09:59:59+08:00") };
        let exact = Schedule::Once { at: now };
        assert_eq!(calc().next_trigger(&future, now, None), Some(at("2024-01-01T10:00:01+08:00")));
        assert_eq!(calc().next_trigger(&past, now, None), None);
        assert_eq!(calc().next_trigger(&exact, now, None), None);
    }

    #[test]
    fn test_daily_rolls_to_tomorrow() {
        let schedule = Schedule::Daily { times: vec![tod("09:00")] };
        let now = at("2024-01-01T10:00:00+08:00");
        assert_eq!(
            calc().next_trigger(&schedule, now, None),
            Some(at("2024-01-02T09:00:00+08:00"))
        );
    }

    #[test]
    fn test_daily_picks_earliest_remaining() {
        let schedule = Schedule::Daily { times: vec![tod("21:00"), tod("08:00"), tod("12:30")] };
        let now = at("2024-01-01T10:00:00+08:00");
        assert_eq!(
            calc().next_trigger(&schedule, now, None),
            Some(at("2024-01-01T12:30:00+08:00"))
        );
    }

    #[test]
    fn test_weekly() {
        // 2024-01-01 is a Monday
        let schedule = Schedule::Weekly { days: vec![1, 3], time: tod("08:00") };
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-01-01T07:00:00+08:00"), None),
            Some(at("2024-01-01T08:00:00+08:00"))
        );
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-01-01T09:00:00+08:00"), None),
            Some(at("2024-01-03T08:00:00+08:00"))
        );
    }

    #[test]
    fn test_weekly_same_day_next_week() {
        let schedule = Schedule::Weekly { days: vec![1], time: tod("08:00") };
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-01-01T09:00:00+08:00"), None),
            Some(at("2024-01-08T08:00:00+08:00"))
        );
    }

    #[test]
    fn test_monthly_skips_short_month() {
        let schedule = Schedule::Monthly { days: vec![31], time: tod("12:00") };
        // April has 30 days
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-04-10T08:00:00+08:00"), None),
            Some(at("2024-05-31T12:00:00+08:00"))
        );
        // From 31 January past noon, February is skipped entirely
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-01-31T13:00:00+08:00"), None),
            Some(at("2024-03-31T12:00:00+08:00"))
        );
    }

    #[test]
    fn test_monthly_multiple_days() {
        let schedule = Schedule::Monthly { days: vec![20, 5], time: tod("09:00") };
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-01-10T08:00:00+08:00"), None),
            Some(at("2024-01-20T09:00:00+08:00"))
        );
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-12-21T08:00:00+08:00"), None),
            Some(at("2025-01-05T09:00:00+08:00"))
        );
    }

    #[test]
    fn test_monthly_interval_every_two_months() {
        let schedule = Schedule::MonthlyInterval {
            interval: 2,
            first_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            time: tod("10:00"),
        };
        let mut now = at("2024-01-01T12:00:00+08:00");
        let end = at("2025-01-31T12:00:00+08:00");
        let mut seen = BTreeSet::new();
        let mut previous: Option<DateTime<Utc>> = None;
        while now < end {
            let next = calc().next_trigger(&schedule, now, None).unwrap();
            assert!(next > now);
            if let Some(prev) = previous {
                assert!(next >= prev, "trigger went backwards at {now}");
            }
            previous = Some(next);
            seen.insert(next);
            now += Duration::days(1);
        }
        let expected: BTreeSet<_> = [
            "2024-01-15", "2024-03-15", "2024-05-15", "2024-07-15", "2024-09-15",
            "2024-11-15", "2025-01-15", "2025-03-15",
        ]
        .iter()
        .map(|d| at(&format!("{d}T10:00:00+08:00")))
        .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_monthly_interval_clamps_to_month_end() {
        let schedule = Schedule::MonthlyInterval {
            interval: 1,
            first_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            time: tod("09:00"),
        };
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-02-10T00:00:00+08:00"), None),
            Some(at("2024-02-29T09:00:00+08:00"))
        );
        // Clamping does not drift: March is back on the 31st
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-03-01T00:00:00+08:00"), None),
            Some(at("2024-03-31T09:00:00+08:00"))
        );
    }

    #[test]
    fn test_hourly() {
        let schedule = Schedule::Hourly { minute: 30, start_hour: None, end_hour: None };
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-01-01T10:10:00+08:00"), None),
            Some(at("2024-01-01T10:30:00+08:00"))
        );
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-01-01T10:30:00+08:00"), None),
            Some(at("2024-01-01T11:30:00+08:00"))
        );
    }

    #[test]
    fn test_hourly_window() {
        let schedule = Schedule::Hourly { minute: 0, start_hour: Some(9), end_hour: Some(18) };
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-01-01T06:20:00+08:00"), None),
            Some(at("2024-01-01T09:00:00+08:00"))
        );
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-01-01T18:20:00+08:00"), None),
            Some(at("2024-01-02T09:00:00+08:00"))
        );
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-01-01T12:20:00+08:00"), None),
            Some(at("2024-01-01T13:00:00+08:00"))
        );
    }

    #[test]
    fn test_hourly_invalid_minute() {
        let schedule = Schedule::Hourly { minute: 60, start_hour: None, end_hour: None };
        assert_eq!(calc().next_trigger(&schedule, Utc::now(), None), None);
    }

    #[test]
    fn test_interval() {
        let schedule = Schedule::Interval { minutes: 30 };
        let now = at("2024-01-01T10:00:00+08:00");
        assert_eq!(
            calc().next_trigger(&schedule, now, Some(at("2024-01-01T09:45:00+08:00"))),
            Some(at("2024-01-01T10:15:00+08:00"))
        );
        // Stale last push: restart from now
        assert_eq!(
            calc().next_trigger(&schedule, now, Some(at("2024-01-01T08:00:00+08:00"))),
            Some(at("2024-01-01T10:30:00+08:00"))
        );
        assert_eq!(calc().next_trigger(&schedule, now, None), Some(at("2024-01-01T10:30:00+08:00")));
        assert_eq!(calc().next_trigger(&Schedule::Interval { minutes: 0 }, now, None), None);
    }

    #[test]
    fn test_workdays_and_weekend() {
        let workdays = Schedule::Workdays { times: vec![tod("18:00"), tod("08:30")] };
        let weekend = Schedule::Weekend { times: vec![tod("10:00")] };
        // Friday evening
        let now = at("2024-01-05T19:00:00+08:00");
        assert_eq!(
            calc().next_trigger(&workdays, now, None),
            Some(at("2024-01-08T08:30:00+08:00"))
        );
        assert_eq!(
            calc().next_trigger(&weekend, now, None),
            Some(at("2024-01-06T10:00:00+08:00"))
        );
        // Friday morning picks the earlier time first
        assert_eq!(
            calc().next_trigger(&workdays, at("2024-01-05T07:00:00+08:00"), None),
            Some(at("2024-01-05T08:30:00+08:00"))
        );
    }

    #[test]
    fn test_custom() {
        let schedule = Schedule::Custom {
            dates: vec![
                at("2024-03-01T09:00:00+08:00"),
                at("2024-02-01T09:00:00+08:00"),
                at("2023-12-01T09:00:00+08:00"),
            ],
        };
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-01-01T00:00:00+08:00"), None),
            Some(at("2024-02-01T09:00:00+08:00"))
        );
        assert_eq!(calc().next_trigger(&schedule, at("2024-04-01T00:00:00+08:00"), None), None);
    }

    #[test]
    fn test_cron_uses_configured_timezone() {
        let schedule = Schedule::Cron { expression: "0 9 * * *".into() };
        assert_eq!(
            calc().next_trigger(&schedule, at("2024-01-01T10:00:00+08:00"), None),
            Some(at("2024-01-02T09:00:00+08:00"))
        );
        let bad = Schedule::Cron { expression: "not a cron".into() };
        assert_eq!(calc().next_trigger(&bad, Utc::now(), None), None);
    }

    #[test]
    fn test_never_in_the_past() {
        let schedules = vec![
            Schedule::Hourly { minute: 45, start_hour: Some(8), end_hour: Some(20) },
            Schedule::Daily { times: vec![tod("00:00"), tod("23:59")] },
            Schedule::Weekly { days: vec![0, 6], time: tod("07:15") },
            Schedule::Monthly { days: vec![1, 29, 30, 31], time: tod("23:30") },
            Schedule::MonthlyInterval {
                interval: 3,
                first_date: NaiveDate::from_ymd_opt(2023, 11, 30).unwrap(),
                time: tod("06:00"),
            },
            Schedule::Interval { minutes: 90 },
            Schedule::Workdays { times: vec![tod("09:00")] },
            Schedule::Weekend { times: vec![tod("09:00")] },
            Schedule::Cron { expression: "15 */4 * * 1-5".into() },
        ];
        let mut now = at("2024-01-01T00:00:00+08:00");
        for _ in 0..500 {
            for schedule in &schedules {
                if let Some(next) = calc().next_trigger(schedule, now, Some(now - Duration::hours(3))) {
                    assert!(next > now, "{} produced {next} at {now}", schedule.kind());
                } else {
                    panic!("{} produced nothing at {now}", schedule.kind());
                }
            }
            now += Duration::minutes(17 * 60 + 13);
        }
    }

    #[test]
    fn test_add_months() {
        assert_eq!(add_months(2024, 11, 3), (2025, 2));
        assert_eq!(add_months(2024, 1, -1), (2023, 12));
        assert_eq!(last_day_of_month(2024, 2), Some(29));
        assert_eq!(last_day_of_month(2023, 2), Some(28));
        assert_eq!(last_day_of_month(2024, 12), Some(31));
    }
}
