use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::error::StewardError;

/// Parsed 5-field cron expression (minute hour day-of-month month
/// day-of-week). Supports `*`, lists (`1,3,5`), ranges (`1-5`), and steps
/// (`*/5`, `10-30/5`). Day-of-week 0 and 7 both mean Sunday.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    days: u32,
    months: u16,
    weekdays: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

/// Upper bound on the forward scan. Four years covers the rarest valid
/// schedule (Feb 29); anything that does not fire within it never fires.
const SCAN_HORIZON_DAYS: i64 = 366 * 4;

pub fn next_fire_time(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, StewardError> {
    let parsed = CronExpr::parse(expr)?;
    parsed.next_after(after).ok_or_else(|| {
        StewardError::InvalidExpression(format!(
            "{expr:?} never fires within {SCAN_HORIZON_DAYS} days"
        ))
    })
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, StewardError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(StewardError::InvalidExpression(format!(
                "expected 5 fields, got {}",
                fields.len()
            )));
        }

        let (minutes, _) = parse_field(fields[0], 0, 59, "minute")?;
        let (hours, _) = parse_field(fields[1], 0, 23, "hour")?;
        let (days, dom_restricted) = parse_field(fields[2], 1, 31, "day-of-month")?;
        let (months, _) = parse_field(fields[3], 1, 12, "month")?;
        let (dow_raw, dow_restricted) = parse_field(fields[4], 0, 7, "day-of-week")?;

        // Fold 7 (alias for Sunday) onto bit 0.
        let mut weekdays = (dow_raw & 0x7f) as u8;
        if dow_raw & (1 << 7) != 0 {
            weekdays |= 1;
        }

        Ok(Self {
            minutes,
            hours: hours as u32,
            days: days as u32,
            months: months as u16,
            weekdays,
            dom_restricted,
            dow_restricted,
        })
    }

    /// Next fire time strictly after `after`, at whole-minute granularity.
    /// `None` when the expression cannot fire within the scan horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = after + Duration::days(SCAN_HORIZON_DAYS);

        while t <= horizon {
            if self.months & (1 << t.month()) == 0 {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_next_day(t)?;
                continue;
            }
            if let Some(found) = self.next_time_in_day(t) {
                return Some(found);
            }
            t = start_of_next_day(t)?;
        }

        None
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days & (1 << t.day()) != 0;
        let dow = self.weekdays & (1 << t.weekday().num_days_from_sunday()) != 0;
        // Conventional cron rule: when both fields are restricted, either
        // one matching makes the day eligible.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    fn next_time_in_day(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        for hour in t.hour()..24 {
            if self.hours & (1 << hour) == 0 {
                continue;
            }
            let from_minute = if hour == t.hour() { t.minute() } else { 0 };
            for minute in from_minute..60 {
                if self.minutes & (1u64 << minute) != 0 {
                    return t.with_hour(hour)?.with_minute(minute);
                }
            }
        }
        None
    }
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = t.date_naive().succ_opt()?;
    Some(next.and_hms_opt(0, 0, 0)?.and_utc())
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Parse one field into a bitmask over `min..=max`. The second value is
/// whether the field restricts anything (false for a bare `*`).
fn parse_field(
    spec: &str,
    min: u32,
    max: u32,
    name: &'static str,
) -> Result<(u64, bool), StewardError> {
    let mut mask: u64 = 0;
    let mut restricted = false;

    for item in spec.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(invalid(name, spec, "empty list item"));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step_raw)) => {
                let step = step_raw
                    .parse::<u32>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| invalid(name, spec, "bad step"))?;
                (range, step)
            }
            None => (item, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(a, min, max, name, spec)?;
            let hi = parse_value(b, min, max, name, spec)?;
            if lo > hi {
                return Err(invalid(name, spec, "range start exceeds end"));
            }
            (lo, hi)
        } else {
            let v = parse_value(range, min, max, name, spec)?;
            (v, v)
        };

        if range != "*" || step > 1 {
            restricted = true;
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1u64 << v;
            v += step;
        }
    }

    Ok((mask, restricted))
}

fn parse_value(
    raw: &str,
    min: u32,
    max: u32,
    name: &'static str,
    spec: &str,
) -> Result<u32, StewardError> {
    let value = raw
        .parse::<u32>()
        .map_err(|_| invalid(name, spec, "not a number"))?;
    if value < min || value > max {
        return Err(invalid(name, spec, "value out of range"));
    }
    Ok(value)
}

fn invalid(name: &'static str, spec: &str, why: &str) -> StewardError {
    StewardError::InvalidExpression(format!("{name} field {spec:?}: {why}"))
}
