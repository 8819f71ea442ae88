//! Schedules — generators of future run times.
//!
//! A [`Schedule`] is a pure, deterministic generator: given a point in time
//! it yields the next run times strictly after it.  Schedules never touch the
//! engine; an external loop (see [`crate::scheduler`]) polls them and
//! initiates flow runs.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::ScheduleError;

/// The schedule contract.
///
/// `next_runs` must be deterministic given the same `after`, return
/// timestamps strictly after it, in strictly increasing order, and at most
/// `count` of them (fewer when the schedule is exhausted).
pub trait Schedule: Send + Sync {
    fn next_runs(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>>;
}

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

/// Fixed-period schedule anchored at a reference time.
///
/// Run times are `anchor + k * every` for integer `k >= 0`.
pub struct IntervalSchedule {
    anchor: DateTime<Utc>,
    every: ChronoDuration,
}

impl IntervalSchedule {
    pub fn new(anchor: DateTime<Utc>, every: std::time::Duration) -> Result<Self, ScheduleError> {
        let every = ChronoDuration::from_std(every).map_err(|_| ScheduleError::IntervalTooShort)?;
        if every < ChronoDuration::milliseconds(1) {
            return Err(ScheduleError::IntervalTooShort);
        }
        Ok(Self { anchor, every })
    }
}

impl Schedule for IntervalSchedule {
    fn next_runs(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        // First k with anchor + k * every > after.
        let k = if after < self.anchor {
            0
        } else {
            let elapsed = (after - self.anchor).num_milliseconds();
            elapsed.div_euclid(self.every.num_milliseconds()) + 1
        };

        // i64 millisecond arithmetic; an i32 multiplier would wrap for
        // short periods anchored far in the past.
        let period_ms = self.every.num_milliseconds();
        (0..count as i64)
            .map(|i| self.anchor + ChronoDuration::milliseconds(period_ms * (k + i)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// One-shot
// ---------------------------------------------------------------------------

/// A single run time, then exhausted.
pub struct OneShotSchedule {
    at: DateTime<Utc>,
}

impl OneShotSchedule {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at }
    }
}

impl Schedule for OneShotSchedule {
    fn next_runs(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        if count > 0 && self.at > after {
            vec![self.at]
        } else {
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Cron
// ---------------------------------------------------------------------------

/// Five-field cron schedule (`minute hour day-of-month month day-of-week`),
/// evaluated in UTC at minute resolution.
///
/// Supports `*`, numeric lists, ranges and `/step`; day-of-week accepts `0-7`
/// with both `0` and `7` meaning Sunday.  When both day fields are restricted
/// the run fires on days matching either one, as classic cron does.
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    dom: u64,
    months: u64,
    dow: u64,
    dom_star: bool,
    dow_star: bool,
}

/// Cron search horizon; an expression that never fires within this window is
/// treated as exhausted.
const CRON_HORIZON_DAYS: i64 = 366 * 5;

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidCron {
            expression: expression.to_owned(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let (minutes, _) = parse_field(fields[0], 0, 59).map_err(&invalid)?;
        let (hours, _) = parse_field(fields[1], 0, 23).map_err(&invalid)?;
        let (dom, dom_star) = parse_field(fields[2], 1, 31).map_err(&invalid)?;
        let (months, _) = parse_field(fields[3], 1, 12).map_err(&invalid)?;
        let (mut dow, dow_star) = parse_field(fields[4], 0, 7).map_err(&invalid)?;

        // Fold 7 (Sunday) onto 0.
        if dow & (1 << 7) != 0 {
            dow = (dow | 1) & !(1 << 7);
        }

        Ok(Self {
            expression: expression.to_owned(),
            minutes,
            hours,
            dom,
            months,
            dow,
            dom_star,
            dow_star,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom_ok = bit(self.dom, t.day());
        let dow_ok = bit(self.dow, t.weekday().num_days_from_sunday());
        match (self.dom_star, self.dow_star) {
            (true, true) => true,
            (true, false) => dow_ok,
            (false, true) => dom_ok,
            (false, false) => dom_ok || dow_ok,
        }
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = truncate_to_minute(after)? + ChronoDuration::minutes(1);
        let horizon = t + ChronoDuration::days(CRON_HORIZON_DAYS);

        while t < horizon {
            if !bit(self.months, t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_next_day(t)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = start_of_next_hour(t)?;
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += ChronoDuration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl Schedule for CronSchedule {
    fn next_runs(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut runs = Vec::with_capacity(count);
        let mut cursor = after;
        while runs.len() < count {
            match self.next_after(cursor) {
                Some(t) => {
                    cursor = t;
                    runs.push(t);
                }
                None => break,
            }
        }
        runs
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1 << value) != 0
}

/// Parse one cron field into a bitmask over `min..=max`.
///
/// Returns the mask plus whether the field was a bare wildcard (needed for
/// the classic day-of-month / day-of-week interaction).
fn parse_field(field: &str, min: u32, max: u32) -> Result<(u64, bool), String> {
    if field.is_empty() {
        return Err("empty field".to_owned());
    }

    let is_star = field.starts_with('*');
    let mut mask = 0u64;

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                if step == 0 {
                    return Err("step must be positive".to_owned());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| format!("invalid value '{lo}'"))?;
            let hi: u32 = hi.parse().map_err(|_| format!("invalid value '{hi}'"))?;
            (lo, hi)
        } else {
            let v: u32 = range
                .parse()
                .map_err(|_| format!("invalid value '{range}'"))?;
            // A bare value with a step ("3/5") ranges up to the max.
            if step > 1 { (v, max) } else { (v, v) }
        };

        if lo < min || hi > max {
            return Err(format!("value out of range {min}-{max}: '{part}'"));
        }
        if lo > hi {
            return Err(format!("inverted range '{part}'"));
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }

    Ok((mask, is_star))
}

fn truncate_to_minute(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    t.with_second(0)?.with_nanosecond(0)
}

fn start_of_next_hour(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(truncate_to_minute(t)?.with_minute(0)? + ChronoDuration::hours(1))
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&next))
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&first))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid RFC 3339 timestamp")
    }

    #[test]
    fn interval_runs_are_strictly_after_and_periodic() {
        let schedule = IntervalSchedule::new(
            at("2026-01-01T00:00:00Z"),
            std::time::Duration::from_secs(3600),
        )
        .unwrap();

        let runs = schedule.next_runs(at("2026-01-01T01:00:00Z"), 3);
        assert_eq!(
            runs,
            vec![
                at("2026-01-01T02:00:00Z"),
                at("2026-01-01T03:00:00Z"),
                at("2026-01-01T04:00:00Z"),
            ]
        );
    }

    #[test]
    fn interval_before_anchor_starts_at_anchor() {
        let anchor = at("2026-06-01T12:00:00Z");
        let schedule =
            IntervalSchedule::new(anchor, std::time::Duration::from_secs(60)).unwrap();
        let runs = schedule.next_runs(at("2026-01-01T00:00:00Z"), 2);
        assert_eq!(runs[0], anchor);
    }

    #[test]
    fn interval_is_deterministic() {
        let schedule = IntervalSchedule::new(
            at("2026-01-01T00:00:00Z"),
            std::time::Duration::from_secs(90),
        )
        .unwrap();
        let after = at("2026-03-04T05:06:07Z");
        assert_eq!(schedule.next_runs(after, 5), schedule.next_runs(after, 5));
    }

    #[test]
    fn short_period_anchored_far_in_the_past_stays_strictly_after() {
        // More than i32::MAX periods elapsed between anchor and `after`.
        let schedule = IntervalSchedule::new(
            at("2026-01-01T00:00:00Z"),
            std::time::Duration::from_millis(1),
        )
        .unwrap();

        let after = at("2026-02-05T00:00:00Z");
        let runs = schedule.next_runs(after, 3);
        assert_eq!(runs.len(), 3);
        let mut previous = after;
        for run in runs {
            assert!(run > previous, "{run} is not strictly after {previous}");
            previous = run;
        }
    }

    #[test]
    fn sub_millisecond_interval_is_rejected() {
        let err = IntervalSchedule::new(Utc::now(), std::time::Duration::from_nanos(10));
        assert!(matches!(err, Err(ScheduleError::IntervalTooShort)));
    }

    #[test]
    fn one_shot_fires_once_then_exhausts() {
        let fire = at("2026-05-01T08:00:00Z");
        let schedule = OneShotSchedule::new(fire);
        assert_eq!(schedule.next_runs(at("2026-04-30T00:00:00Z"), 5), vec![fire]);
        assert!(schedule.next_runs(fire, 5).is_empty());
    }

    #[test]
    fn cron_every_quarter_hour() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let runs = schedule.next_runs(at("2026-02-03T10:07:12Z"), 3);
        assert_eq!(
            runs,
            vec![
                at("2026-02-03T10:15:00Z"),
                at("2026-02-03T10:30:00Z"),
                at("2026-02-03T10:45:00Z"),
            ]
        );
    }

    #[test]
    fn cron_daily_at_noon_rolls_to_next_day() {
        let schedule = CronSchedule::parse("0 12 * * *").unwrap();
        let runs = schedule.next_runs(at("2026-02-03T12:00:00Z"), 2);
        // 12:00 itself is not strictly after 12:00.
        assert_eq!(
            runs,
            vec![at("2026-02-04T12:00:00Z"), at("2026-02-05T12:00:00Z")]
        );
    }

    #[test]
    fn cron_weekday_field_accepts_sunday_as_seven() {
        let on_seven = CronSchedule::parse("0 0 * * 7").unwrap();
        let on_zero = CronSchedule::parse("0 0 * * 0").unwrap();
        let after = at("2026-02-03T00:00:00Z");
        assert_eq!(on_seven.next_runs(after, 2), on_zero.next_runs(after, 2));
        // 2026-02-08 is a Sunday.
        assert_eq!(on_zero.next_runs(after, 1), vec![at("2026-02-08T00:00:00Z")]);
    }

    #[test]
    fn cron_restricted_dom_and_dow_fire_on_either() {
        // Classic cron: day-of-month 15 OR Mondays.
        let schedule = CronSchedule::parse("0 0 15 * 1").unwrap();
        let runs = schedule.next_runs(at("2026-02-13T00:00:00Z"), 2);
        // 2026-02-15 is a Sunday (matches dom), 2026-02-16 a Monday.
        assert_eq!(
            runs,
            vec![at("2026-02-15T00:00:00Z"), at("2026-02-16T00:00:00Z")]
        );
    }

    #[test]
    fn cron_monthly_ranges_and_lists() {
        let schedule = CronSchedule::parse("30 6 1 1,7 *").unwrap();
        let runs = schedule.next_runs(at("2026-02-01T00:00:00Z"), 2);
        assert_eq!(
            runs,
            vec![at("2026-07-01T06:30:00Z"), at("2027-01-01T06:30:00Z")]
        );
    }

    #[test]
    fn cron_rejects_malformed_expressions() {
        for expr in ["", "* * *", "61 * * * *", "* * * * 9", "*/0 * * * *", "5-1 * * * *"] {
            assert!(
                matches!(
                    CronSchedule::parse(expr),
                    Err(ScheduleError::InvalidCron { .. })
                ),
                "'{expr}' should be rejected"
            );
        }
    }

    #[test]
    fn cron_is_deterministic() {
        let schedule = CronSchedule::parse("7 3 * * 2").unwrap();
        let after = at("2026-08-30T00:00:00Z");
        assert_eq!(schedule.next_runs(after, 4), schedule.next_runs(after, 4));
    }
}
