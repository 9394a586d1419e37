//! Calendar expressions for the maintenance trigger
//!
//! Five-field expressions use classic cron conventions (`min hour dom month
//! dow`, day-of-week 0-7 with 0 and 7 both Sunday). Six- and seven-field
//! expressions carry a leading seconds column and are handed to the `cron`
//! crate as written, so their day-of-week runs 1-7 with 1 = Sunday.
//! All expressions are evaluated in UTC.

use chrono::{DateTime, Utc};
use std::str::FromStr;
use thiserror::Error;

/// Invalid calendar expression
#[derive(Debug, Error)]
#[error("invalid schedule '{expression}': {reason}")]
pub struct ScheduleError {
    pub expression: String,
    pub reason: String,
}

/// Parsed calendar expression
#[derive(Debug, Clone)]
pub struct CalendarSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CalendarSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError {
            expression: expression.to_string(),
            reason,
        };

        let trimmed = expression.trim();
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => {
                let dow = classic_day_of_week(fields[4]).map_err(invalid)?;
                format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow)
            }
            6 | 7 => fields.join(" "),
            n => return Err(invalid(format!("expected 5, 6 or 7 fields, found {}", n))),
        };

        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First firing strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Rewrite a classic day-of-week field (0/7 = Sunday) into the `cron`
/// crate's numbering (1 = Sunday). Names and `*` pass through.
fn classic_day_of_week(field: &str) -> Result<String, String> {
    let mut items = Vec::new();

    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };

        let mapped = match range.split_once('-') {
            Some((start, end)) => {
                let start = shift_day(start)?;
                match (end.parse::<u8>(), step) {
                    // Sunday closing a range wraps to the start of the week
                    (Ok(7), None) if start == "7" => "7,1".to_string(),
                    (Ok(7), None) => format!("{}-7,1", start),
                    (Ok(7), Some(_)) => {
                        return Err(format!(
                            "day-of-week range '{}' ending at 7 cannot take a step",
                            range
                        ))
                    }
                    _ => format!("{}-{}", start, shift_day(end)?),
                }
            }
            None => shift_day(range)?,
        };

        items.push(match step {
            Some(step) => format!("{}/{}", mapped, step),
            None => mapped,
        });
    }

    Ok(items.join(","))
}

fn shift_day(token: &str) -> Result<String, String> {
    match token.parse::<u8>() {
        Ok(0) | Ok(7) => Ok("1".to_string()),
        Ok(n @ 1..=6) => Ok((n + 1).to_string()),
        Ok(n) => Err(format!("day-of-week {} outside 0-7", n)),
        Err(_) => Ok(token.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_five_field_expression_daily_midnight() {
        let schedule = CalendarSchedule::parse("0 0 * * *").unwrap();

        let next = schedule.next_after(at(2026, 3, 14, 15, 30)).unwrap();
        assert_eq!(next, at(2026, 3, 15, 0, 0));
    }

    #[test]
    fn test_six_field_expression_with_seconds() {
        let schedule = CalendarSchedule::parse("30 15 3 * * *").unwrap();

        let next = schedule.next_after(at(2026, 3, 14, 4, 0)).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (3, 15, 30));
        assert_eq!(next.day(), 15);
    }

    #[test]
    fn test_next_after_is_strict() {
        let schedule = CalendarSchedule::parse("0 0 * * *").unwrap();

        let next = schedule.next_after(at(2026, 3, 15, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 16, 0, 0));
    }

    #[test]
    fn test_classic_sunday_numbering() {
        // 2026-03-14 is a Saturday
        for expr in ["0 0 * * 0", "0 0 * * 7", "0 0 * * Sun"] {
            let schedule = CalendarSchedule::parse(expr).unwrap();
            let next = schedule.next_after(at(2026, 3, 14, 12, 0)).unwrap();
            assert_eq!(next.weekday(), Weekday::Sun, "{expr}");
        }
    }

    #[test]
    fn test_classic_weekday_ranges() {
        let weekdays = CalendarSchedule::parse("0 0 * * 1-5").unwrap();
        let next = weekdays.next_after(at(2026, 3, 14, 12, 0)).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);

        let weekend = CalendarSchedule::parse("0 0 * * 6-7").unwrap();
        let sat = weekend.next_after(at(2026, 3, 13, 12, 0)).unwrap();
        assert_eq!(sat.weekday(), Weekday::Sat);
        let sun = weekend.next_after(sat).unwrap();
        assert_eq!(sun.weekday(), Weekday::Sun);
    }

    #[test]
    fn test_day_of_week_mapping() {
        assert_eq!(classic_day_of_week("*").unwrap(), "*");
        assert_eq!(classic_day_of_week("0,3").unwrap(), "1,4");
        assert_eq!(classic_day_of_week("1-5").unwrap(), "2-6");
        assert_eq!(classic_day_of_week("*/2").unwrap(), "*/2");
        assert_eq!(classic_day_of_week("5-7").unwrap(), "6-7,1");
        assert_eq!(classic_day_of_week("6-7").unwrap(), "7,1");
        assert!(classic_day_of_week("8").is_err());
        assert!(classic_day_of_week("5-7/2").is_err());
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(CalendarSchedule::parse("").is_err());
        assert!(CalendarSchedule::parse("every day").is_err());
        assert!(CalendarSchedule::parse("61 0 * * *").is_err());
    }
}
