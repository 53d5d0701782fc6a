//! Splunk-like time expressions for `logs` / `stats` / `crash_stats`.
//!
//! Accepted forms:
//! - relative: `-15m`, `+2h`, units s/m/h/d/w
//! - snap: `@h`, `@d`, `@w`, `@M`, `@y` (also s/m), combinable: `-1d@d`
//! - absolute: `2026-03-05`, `2026-03-05T10:30:45`, optional trailing `Z`,
//!   bare unix seconds
//! - keywords: `now`, `today`, `yesterday`
//!
//! Snapping is done in UTC.

use crate::store::TimeRange;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time};

pub fn parse_range(from: &str, to: &str, now: OffsetDateTime) -> crate::Result<TimeRange> {
    let from_t = parse_time(from, now)?;
    let to_t = parse_time(to, now)?;
    if from_t > to_t {
        return Err(format!("range start {} is after end {}", from, to).into());
    }
    Ok(TimeRange {
        from: from_t.unix_timestamp(),
        to: to_t.unix_timestamp(),
    })
}

pub fn parse_time(spec: &str, now: OffsetDateTime) -> crate::Result<OffsetDateTime> {
    let s = spec.trim();
    match s {
        "" => return Err("empty time expression".into()),
        "now" => return Ok(now),
        "today" => return snap(now, "d"),
        "yesterday" => return Ok(snap(now, "d")? - Duration::days(1)),
        _ => {}
    }

    if s.starts_with('+') || s.starts_with('-') || s.starts_with('@') {
        return parse_relative(s, now);
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        let secs: i64 = s.parse().map_err(|_| format!("bad unix timestamp: {}", s))?;
        return OffsetDateTime::from_unix_timestamp(secs)
            .map_err(|_| format!("unix timestamp out of range: {}", s).into());
    }

    parse_absolute(s)
}

fn parse_relative(s: &str, now: OffsetDateTime) -> crate::Result<OffsetDateTime> {
    let (rel, snap_unit) = match s.split_once('@') {
        Some((rel, unit)) => (rel, Some(unit)),
        None => (s, None),
    };

    let mut t = now;
    if !rel.is_empty() {
        let (sign, body) = match rel.split_at(1) {
            ("-", body) => (-1i64, body),
            ("+", body) => (1i64, body),
            _ => return Err(format!("bad relative time: {}", s).into()),
        };

        let digits_end = body
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in relative time: {}", s))?;
        if digits_end == 0 {
            return Err(format!("missing amount in relative time: {}", s).into());
        }
        let amount: i64 = body[..digits_end]
            .parse()
            .map_err(|_| format!("bad amount in relative time: {}", s))?;

        let step = match &body[digits_end..] {
            "s" => Duration::seconds(amount),
            "m" => Duration::minutes(amount),
            "h" => Duration::hours(amount),
            "d" => Duration::days(amount),
            "w" => Duration::weeks(amount),
            unit => return Err(format!("unknown time unit: {}", unit).into()),
        };
        t += step * sign as i32;
    }

    match snap_unit {
        Some(unit) => snap(t, unit),
        None => Ok(t),
    }
}

fn snap(t: OffsetDateTime, unit: &str) -> crate::Result<OffsetDateTime> {
    let ts = t.unix_timestamp();
    let from_unix = |secs: i64| {
        OffsetDateTime::from_unix_timestamp(secs)
            .map_err(|_| format!("snap out of range at {}", secs).into())
    };

    match unit {
        "s" => from_unix(ts),
        "m" => from_unix(ts - ts.rem_euclid(60)),
        "h" => from_unix(ts - ts.rem_euclid(3600)),
        "d" => from_unix(ts - ts.rem_euclid(86400)),
        "w" => {
            // Weeks start on Monday.
            let day = snap(t, "d")?;
            let back = day.weekday().number_days_from_monday() as i64;
            Ok(day - Duration::days(back))
        }
        "M" => {
            let first = Date::from_calendar_date(t.year(), t.month(), 1)
                .map_err(|e| format!("month snap failed: {}", e))?;
            Ok(PrimitiveDateTime::new(first, Time::MIDNIGHT).assume_utc())
        }
        "y" => {
            let first = Date::from_calendar_date(t.year(), time::Month::January, 1)
                .map_err(|e| format!("year snap failed: {}", e))?;
            Ok(PrimitiveDateTime::new(first, Time::MIDNIGHT).assume_utc())
        }
        other => Err(format!("unknown snap unit: @{}", other).into()),
    }
}

fn parse_absolute(s: &str) -> crate::Result<OffsetDateTime> {
    if s.contains('T') {
        let body = s.strip_suffix('Z').unwrap_or(s);
        let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
        let dt = PrimitiveDateTime::parse(body, &format)
            .map_err(|_| format!("bad timestamp: {}", s))?;
        return Ok(dt.assume_utc());
    }

    let format = format_description!("[year]-[month]-[day]");
    let date = Date::parse(s, &format).map_err(|_| format!("bad date: {}", s))?;
    Ok(PrimitiveDateTime::new(date, Time::MIDNIGHT).assume_utc())
}
