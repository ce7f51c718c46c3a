//! Cron expression parsing and next-run calculation.
//!
//! Five fields, `minute hour dayOfMonth month dayOfWeek`, with `*`,
//! lists, ranges, and steps. Day-of-week accepts 7 as Sunday. "Day"
//! matches `DoM AND *` or `* AND DoW` normally; when both fields are
//! restricted the day matches on `DoM OR DoW`. `next_run(after)` is
//! strictly greater than `after` and rejects when nothing matches
//! within ten years.

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use sheetflow_common::{FlowError, FlowErrorKind};

fn parse_error(msg: impl Into<String>) -> FlowError {
    FlowError::new(FlowErrorKind::CronParse).with_message(msg.into())
}

/// One field as a 64-bit membership mask plus a restriction flag
/// (a bare `*` is unrestricted even though its mask is full).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    mask: u64,
    restricted: bool,
}

impl Field {
    fn contains(&self, v: u32) -> bool {
        self.mask & (1 << v) != 0
    }
}

fn parse_field(text: &str, min: u32, max: u32, wrap_seven: bool) -> Result<Field, FlowError> {
    if text.is_empty() {
        return Err(parse_error("empty field"));
    }
    let mut mask: u64 = 0;
    let mut restricted = false;
    for part in text.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| parse_error(format!("bad step '{s}'")))?;
                if step == 0 {
                    return Err(parse_error("step must be positive"));
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            if step == 1 && part == "*" {
                // Bare star leaves the field unrestricted.
                mask |= ((1u128 << (max + 1)) - (1u128 << min)) as u64;
                continue;
            }
            (min, max)
        } else {
            match range.split_once('-') {
                Some((a, b)) => {
                    let lo = parse_component(a, wrap_seven)?;
                    let hi = parse_component(b, wrap_seven)?;
                    (lo, hi)
                }
                None => {
                    let v = parse_component(range, wrap_seven)?;
                    (v, v)
                }
            }
        };
        if lo < min || hi > max || lo > hi {
            return Err(parse_error(format!(
                "value out of range in '{part}' (allowed {min}-{max})"
            )));
        }
        restricted = true;
        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok(Field { mask, restricted })
}

fn parse_component(s: &str, wrap_seven: bool) -> Result<u32, FlowError> {
    let v: u32 = s
        .parse()
        .map_err(|_| parse_error(format!("bad value '{s}'")))?;
    // Day-of-week accepts 7 as Sunday.
    Ok(if wrap_seven && v == 7 { 0 } else { v })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, FlowError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(parse_error(format!(
                "expected 5 fields, found {}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, false)?,
            hour: parse_field(fields[1], 0, 23, false)?,
            day_of_month: parse_field(fields[2], 1, 31, false)?,
            month: parse_field(fields[3], 1, 12, false)?,
            day_of_week: parse_field(fields[4], 0, 7, true)?,
        })
    }

    fn day_matches(&self, date: chrono::NaiveDate) -> bool {
        let dom = self.day_of_month.contains(date.day());
        let dow = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (self.day_of_month.restricted, self.day_of_week.restricted) {
            // Both restricted: vixie-cron OR semantics.
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// The first matching instant strictly after `after`.
    pub fn next_run(&self, after: NaiveDateTime) -> Result<NaiveDateTime, FlowError> {
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + Duration::minutes(1);

        // Ten-year horizon, scanned day by day.
        let horizon_days = 366 * 10;
        for day_offset in 0..horizon_days {
            let date = start.date() + Duration::days(day_offset);
            if !self.month.contains(date.month()) || !self.day_matches(date) {
                continue;
            }
            let (h0, m0) = if day_offset == 0 {
                (start.hour(), start.minute())
            } else {
                (0, 0)
            };
            for hour in h0..24 {
                if !self.hour.contains(hour) {
                    continue;
                }
                let from_minute = if day_offset == 0 && hour == h0 { m0 } else { 0 };
                for minute in from_minute..60 {
                    if self.minute.contains(minute) {
                        let t = date
                            .and_hms_opt(hour, minute, 0)
                            .ok_or_else(|| parse_error("invalid time"))?;
                        return Ok(t);
                    }
                }
            }
        }
        Err(FlowError::new(FlowErrorKind::CronNoMatchWithinHorizon)
            .with_message("no matching time within ten years"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    #[test]
    fn every_five_minutes_lands_on_multiples() {
        let s = CronSchedule::parse("*/5 * * * *").unwrap();
        let mut t = at(2024, 1, 1, 0, 0);
        for _ in 0..20 {
            t = s.next_run(t).unwrap();
            assert_eq!(t.minute() % 5, 0);
        }
    }

    #[test]
    fn next_run_is_strictly_greater_and_monotone() {
        let s = CronSchedule::parse("30 9 * * 1-5").unwrap();
        let t0 = at(2024, 3, 1, 9, 30);
        let t1 = s.next_run(t0).unwrap();
        assert!(t1 > t0);
        let t2 = s.next_run(t1).unwrap();
        assert!(t2 > t1);
    }

    #[test]
    fn dom_and_dow_both_restricted_match_either() {
        // The 13th OR a Friday.
        let s = CronSchedule::parse("0 0 13 * 5").unwrap();
        // 2024-09-05 is a Thursday; next match is Friday the 6th.
        let t = s.next_run(at(2024, 9, 5, 1, 0)).unwrap();
        assert_eq!(t, at(2024, 9, 6, 0, 0));
        // After Friday the 6th, the 13th (a Friday anyway) comes next
        // via the DoM arm.
        let t2 = s.next_run(at(2024, 9, 7, 0, 0)).unwrap();
        assert_eq!(t2, at(2024, 9, 13, 0, 0));
    }

    #[test]
    fn seven_is_sunday() {
        let a = CronSchedule::parse("0 0 * * 7").unwrap();
        let b = CronSchedule::parse("0 0 * * 0").unwrap();
        assert_eq!(a, b);
        let t = a.next_run(at(2024, 9, 5, 0, 0)).unwrap();
        // 2024-09-08 is a Sunday.
        assert_eq!(t, at(2024, 9, 8, 0, 0));
    }

    #[test]
    fn impossible_schedule_rejects_within_horizon() {
        // February 30th never exists.
        let s = CronSchedule::parse("0 0 30 2 *").unwrap();
        let err = s.next_run(at(2024, 1, 1, 0, 0)).unwrap_err();
        assert_eq!(err.kind, FlowErrorKind::CronNoMatchWithinHorizon);
    }

    #[test]
    fn malformed_expressions_report_parse_error() {
        for bad in ["* * * *", "61 * * * *", "*/0 * * * *", "a * * * *"] {
            let err = CronSchedule::parse(bad).unwrap_err();
            assert_eq!(err.kind, FlowErrorKind::CronParse, "{bad}");
        }
    }
}
