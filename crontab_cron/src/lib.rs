//! ABOUTME: Extended 6-field cron expression parsing and next-firing computation
//! ABOUTME: Fields are second, minute, hour, day-of-month, month, day-of-week; semantics
//! follow the `cronexpr` reference dialect including the `L`, `W`, and `#` qualifiers.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use std::collections::BTreeSet;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CronError {
    #[error("expected 6 whitespace-separated fields, got {0}")]
    WrongFieldCount(usize),
    #[error("invalid field {field:?}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("no firing time found within the search horizon")]
    NoFiringFound,
}

type Result<T> = std::result::Result<T, CronError>;

/// Day-of-month field, including the `L` (last day) and `W` (nearest weekday) qualifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DomSpec {
    Any,
    Values(BTreeSet<u32>),
    LastDay,
    NearestWeekday(u32),
}

/// Day-of-week field, including `L` (last such weekday of the month) and `#` (nth occurrence).
#[derive(Debug, Clone, PartialEq, Eq)]
enum DowSpec {
    Any,
    Values(BTreeSet<u32>),
    LastOfMonth(u32),
    Nth(u32, u32),
}

/// A parsed, ready-to-evaluate cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCron {
    second: Field,
    minute: Field,
    hour: Field,
    dom: DomSpec,
    month: Field,
    dow: DowSpec,
    dom_restricted: bool,
    dow_restricted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    Values(BTreeSet<u32>),
}

impl Field {
    fn matches(&self, v: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Values(set) => set.contains(&v),
        }
    }
}

fn parse_numeric_field(raw: &str, min: u32, max: u32, field_name: &str) -> Result<Field> {
    if raw == "*" {
        return Ok(Field::Any);
    }
    let mut values = BTreeSet::new();
    for part in raw.split(',') {
        parse_range_or_step(part, min, max, field_name, &mut values)?;
    }
    if values.is_empty() {
        return Err(CronError::InvalidField {
            field: field_name.to_string(),
            reason: "no values parsed".to_string(),
        });
    }
    Ok(Field::Values(values))
}

fn parse_range_or_step(
    part: &str,
    min: u32,
    max: u32,
    field_name: &str,
    out: &mut BTreeSet<u32>,
) -> Result<()> {
    let bad = |reason: &str| CronError::InvalidField {
        field: field_name.to_string(),
        reason: reason.to_string(),
    };

    let (base, step) = match part.split_once('/') {
        Some((b, s)) => (
            b,
            Some(s.parse::<u32>().map_err(|_| bad("invalid step"))?),
        ),
        None => (part, None),
    };

    let (range_start, range_end) = if base == "*" {
        (min, max)
    } else if let Some((lo, hi)) = base.split_once('-') {
        let lo: u32 = lo.parse().map_err(|_| bad("invalid range start"))?;
        let hi: u32 = hi.parse().map_err(|_| bad("invalid range end"))?;
        (lo, hi)
    } else {
        let v: u32 = base.parse().map_err(|_| bad("invalid value"))?;
        (v, v)
    };

    if range_start < min || range_end > max || range_start > range_end {
        return Err(bad("value out of range"));
    }

    let step = step.unwrap_or(1).max(1);
    let mut v = range_start;
    while v <= range_end {
        out.insert(v);
        v += step;
    }
    Ok(())
}

fn parse_dom_field(raw: &str) -> Result<DomSpec> {
    if raw == "*" {
        return Ok(DomSpec::Any);
    }
    if raw == "L" {
        return Ok(DomSpec::LastDay);
    }
    if let Some(day) = raw.strip_suffix('W') {
        let day: u32 = day
            .parse()
            .map_err(|_| CronError::InvalidField {
                field: "day-of-month".to_string(),
                reason: "invalid W qualifier".to_string(),
            })?;
        return Ok(DomSpec::NearestWeekday(day));
    }
    Ok(DomSpec::Values(match parse_numeric_field(raw, 1, 31, "day-of-month")? {
        Field::Any => unreachable!(),
        Field::Values(v) => v,
    }))
}

fn parse_dow_field(raw: &str) -> Result<DowSpec> {
    if raw == "*" {
        return Ok(DowSpec::Any);
    }
    if let Some(day) = raw.strip_suffix('L') {
        let day = parse_dow_value(day)?;
        return Ok(DowSpec::LastOfMonth(day));
    }
    if let Some((day, nth)) = raw.split_once('#') {
        let day = parse_dow_value(day)?;
        let nth: u32 = nth.parse().map_err(|_| CronError::InvalidField {
            field: "day-of-week".to_string(),
            reason: "invalid # occurrence".to_string(),
        })?;
        return Ok(DowSpec::Nth(day, nth));
    }
    let mut values = BTreeSet::new();
    for part in raw.split(',') {
        parse_range_or_step(part, 0, 7, "day-of-week", &mut values)?;
    }
    // 7 and 0 both denote Sunday in the reference dialect.
    if values.remove(&7) {
        values.insert(0);
    }
    Ok(DowSpec::Values(values))
}

fn parse_dow_value(raw: &str) -> Result<u32> {
    let v: u32 = raw.parse().map_err(|_| CronError::InvalidField {
        field: "day-of-week".to_string(),
        reason: "invalid weekday".to_string(),
    })?;
    Ok(if v == 7 { 0 } else { v })
}

impl CompiledCron {
    /// Parse a 6-field extended cron expression:
    /// `second minute hour day-of-month month day-of-week`.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(CronError::WrongFieldCount(fields.len()));
        }

        let second = parse_numeric_field(fields[0], 0, 59, "second")?;
        let minute = parse_numeric_field(fields[1], 0, 59, "minute")?;
        let hour = parse_numeric_field(fields[2], 0, 23, "hour")?;
        let dom = parse_dom_field(fields[3])?;
        let month = parse_numeric_field(fields[4], 1, 12, "month")?;
        let dow = parse_dow_field(fields[5])?;

        let dom_restricted = fields[3] != "*";
        let dow_restricted = fields[5] != "*";

        Ok(Self {
            second,
            minute,
            hour,
            dom,
            month,
            dow,
            dom_restricted,
            dow_restricted,
        })
    }

    /// Compute the first firing strictly after `after`.
    ///
    /// Rolls forward field by field (month, day, hour, minute, second), carrying
    /// over on overflow, bounded to a four-year search horizon.
    pub fn next(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let mut candidate = after + Duration::seconds(1);
        candidate = candidate
            .date_naive()
            .and_time(
                NaiveTime::from_hms_opt(candidate.hour(), candidate.minute(), candidate.second())
                    .expect("valid time components"),
            )
            .and_utc();

        let horizon = after + Duration::days(4 * 366);

        loop {
            if candidate > horizon {
                return Err(CronError::NoFiringFound);
            }

            if !self.month.matches(candidate.month()) {
                candidate = self.advance_month(candidate)?;
                continue;
            }

            if !self.day_matches(candidate) {
                candidate = self.advance_day(candidate)?;
                continue;
            }

            if !self.hour.matches(candidate.hour()) {
                candidate = self.advance_hour(candidate)?;
                continue;
            }

            if !self.minute.matches(candidate.minute()) {
                candidate = self.advance_minute(candidate)?;
                continue;
            }

            if !self.second.matches(candidate.second()) {
                candidate = self.advance_second(candidate)?;
                continue;
            }

            return Ok(candidate);
        }
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom_ok = self.dom_matches(t);
        let dow_ok = self.dow_matches(t);

        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    fn dom_matches(&self, t: DateTime<Utc>) -> bool {
        match &self.dom {
            DomSpec::Any => true,
            DomSpec::Values(set) => set.contains(&t.day()),
            DomSpec::LastDay => t.day() == last_day_of_month(t.year(), t.month()),
            DomSpec::NearestWeekday(day) => nearest_weekday(t.year(), t.month(), *day) == t.day(),
        }
    }

    fn dow_matches(&self, t: DateTime<Utc>) -> bool {
        let weekday = t.weekday().num_days_from_sunday();
        match &self.dow {
            DowSpec::Any => true,
            DowSpec::Values(set) => set.contains(&weekday),
            DowSpec::LastOfMonth(day) => {
                weekday == *day && t.day() + 7 > last_day_of_month(t.year(), t.month())
            }
            DowSpec::Nth(day, nth) => weekday == *day && (t.day() - 1) / 7 + 1 == *nth,
        }
    }

    fn advance_month(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let (year, month) = if t.month() == 12 {
            (t.year() + 1, 1)
        } else {
            (t.year(), t.month() + 1)
        };
        NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .ok_or(CronError::NoFiringFound)
    }

    fn advance_day(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let next_day = t.date_naive().succ_opt().ok_or(CronError::NoFiringFound)?;
        Ok(next_day
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc())
    }

    fn advance_hour(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let base = t
            .date_naive()
            .and_hms_opt(t.hour(), 0, 0)
            .expect("valid time")
            .and_utc();
        Ok(base + Duration::hours(1))
    }

    fn advance_minute(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let base = t
            .date_naive()
            .and_hms_opt(t.hour(), t.minute(), 0)
            .expect("valid time")
            .and_utc();
        Ok(base + Duration::minutes(1))
    }

    fn advance_second(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Ok(t + Duration::seconds(1))
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let first_of_next = Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0).unwrap();
    (first_of_next - Duration::days(1)).day()
}

/// The weekday nearest to `day` within the same month (Mon-Fri), clamped to month bounds.
fn nearest_weekday(year: i32, month: u32, day: u32) -> u32 {
    let last = last_day_of_month(year, month);
    let day = day.min(last);
    let date = NaiveDate::from_ymd_opt(year, month, day).expect("day within month bounds");
    let weekday = date.weekday().num_days_from_sunday();
    match weekday {
        0 => {
            // Sunday: move forward to Monday, unless that crosses into next month.
            if day + 1 <= last {
                day + 1
            } else {
                day - 2
            }
        }
        6 => {
            // Saturday: move back to Friday, unless day == 1.
            if day > 1 {
                day - 1
            } else {
                day + 2
            }
        }
        _ => day,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CompiledCron::parse("* * * *").is_err());
    }

    #[test]
    fn every_second_fires_one_second_later() {
        let cron = CompiledCron::parse("* * * * * *").unwrap();
        let now = dt(2026, 1, 1, 0, 0, 0);
        assert_eq!(cron.next(now).unwrap(), dt(2026, 1, 1, 0, 0, 1));
    }

    #[test]
    fn every_n_seconds_step() {
        let cron = CompiledCron::parse("*/5 * * * * *").unwrap();
        let now = dt(2026, 1, 1, 0, 0, 3);
        assert_eq!(cron.next(now).unwrap(), dt(2026, 1, 1, 0, 0, 5));
    }

    #[test]
    fn daily_at_midnight_rolls_to_next_day() {
        let cron = CompiledCron::parse("0 0 0 * * *").unwrap();
        let now = dt(2026, 1, 1, 12, 0, 0);
        assert_eq!(cron.next(now).unwrap(), dt(2026, 1, 2, 0, 0, 0));
    }

    #[test]
    fn dom_or_dow_is_a_union_when_both_restricted() {
        // 15th of the month OR every Monday, at midnight.
        let cron = CompiledCron::parse("0 0 0 15 * 1").unwrap();
        // 2026-01-01 is a Thursday; next Monday is 2026-01-05, before the 15th.
        let now = dt(2026, 1, 1, 0, 0, 1);
        assert_eq!(cron.next(now).unwrap(), dt(2026, 1, 5, 0, 0, 0));
    }

    #[test]
    fn last_day_of_month_qualifier() {
        let cron = CompiledCron::parse("0 0 0 L * *").unwrap();
        let now = dt(2026, 2, 1, 0, 0, 0);
        assert_eq!(cron.next(now).unwrap(), dt(2026, 2, 28, 0, 0, 0));
    }

    #[test]
    fn nth_weekday_of_month_qualifier() {
        // Third Monday of the month at midnight.
        let cron = CompiledCron::parse("0 0 0 * * 1#3").unwrap();
        let now = dt(2026, 1, 1, 0, 0, 0);
        // January 2026: Mondays fall on 5, 12, 19, 26 -> third Monday is the 19th.
        assert_eq!(cron.next(now).unwrap(), dt(2026, 1, 19, 0, 0, 0));
    }

    #[test]
    fn nearest_weekday_qualifier_shifts_off_weekend() {
        // 2026-08-15 is a Saturday; nearest weekday should be Friday the 14th.
        let cron = CompiledCron::parse("0 0 0 15W * *").unwrap();
        let now = dt(2026, 8, 1, 0, 0, 0);
        assert_eq!(cron.next(now).unwrap(), dt(2026, 8, 14, 0, 0, 0));
    }
}
