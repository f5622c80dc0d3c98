//! Repeat intervals: named shorthands and `"<n> <unit>"` expressions.

use chrono::{DateTime, Duration, Months, Utc};

use crate::error::{QueueError, Result};
use crate::types::is_storable;

/// Named shorthands accepted by `Job::repeat`, mapped before storage.
pub const SHORTHANDS: &[(&str, &str)] = &[
    ("daily", "1 day"),
    ("hourly", "1 hour"),
    ("weekly", "1 week"),
    ("biweekly", "2 weeks"),
    ("monthly", "1 month"),
    ("quarterly", "3 months"),
    ("yearly", "1 year"),
];

/// Map a shorthand to its interval string; anything else is returned trimmed.
pub fn normalize(value: &str) -> String {
    let trimmed = value.trim();
    SHORTHANDS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(trimmed))
        .map(|(_, interval)| interval.to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/// A parsed recurrence period. Calendar parts (months) are kept apart from
/// the fixed-length part so `"1 month"` from Jan 31 lands on Feb 28/29.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepeatInterval {
    pub months: u32,
    pub seconds: i64,
}

impl RepeatInterval {
    /// Parse `"1 day"`, `"+2 hours"`, `"1 day 6 hours"` or a shorthand.
    pub fn parse(expr: &str) -> Result<Self> {
        let normalized = normalize(expr);
        let invalid = || QueueError::InvalidRepeat(expr.to_string());

        let mut tokens = normalized.split_whitespace().peekable();
        if tokens.peek().is_none() {
            return Err(invalid());
        }

        let mut interval = RepeatInterval::default();
        while let Some(amount) = tokens.next() {
            let amount: u32 = amount.trim_start_matches('+').parse().map_err(|_| invalid())?;
            let unit = tokens.next().ok_or_else(invalid)?;
            let (months, seconds) = match unit.to_ascii_lowercase().as_str() {
                "second" | "seconds" | "sec" | "secs" => (0, 1),
                "minute" | "minutes" | "min" | "mins" => (0, 60),
                "hour" | "hours" => (0, 3_600),
                "day" | "days" => (0, 86_400),
                "week" | "weeks" => (0, 7 * 86_400),
                "month" | "months" => (1, 0),
                "year" | "years" => (12, 0),
                _ => return Err(invalid()),
            };
            interval.months = amount
                .checked_mul(months)
                .and_then(|m| interval.months.checked_add(m))
                .ok_or_else(invalid)?;
            interval.seconds = i64::from(amount)
                .checked_mul(seconds)
                .and_then(|s| interval.seconds.checked_add(s))
                .ok_or_else(invalid)?;
        }

        // Completion adds the interval to the current time; that result must be storable.
        let reachable = interval.after(Utc::now()).is_some_and(is_storable);
        if interval.is_zero() || !reachable {
            return Err(invalid());
        }
        Ok(interval)
    }

    pub fn is_zero(&self) -> bool {
        self.months == 0 && self.seconds == 0
    }

    /// The instant one interval after `from`, or `None` on calendar overflow.
    pub fn after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let shifted = if self.months > 0 {
            from.checked_add_months(Months::new(self.months))?
        } else {
            from
        };
        shifted.checked_add_signed(Duration::try_seconds(self.seconds)?)
    }
}

/// Compute the next run for a stored repeat expression.
pub fn next_run(expr: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    RepeatInterval::parse(expr)?
        .after(from)
        .filter(|next| is_storable(*next))
        .ok_or_else(|| QueueError::InvalidRepeat(expr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn every_shorthand_parses() {
        for (name, interval) in SHORTHANDS {
            assert_eq!(normalize(name), *interval);
            assert!(RepeatInterval::parse(name).is_ok(), "shorthand: {name}");
        }
        assert_eq!(normalize("  Daily "), "1 day");
    }

    #[test]
    fn raw_expressions() {
        assert_eq!(RepeatInterval::parse("90 seconds").unwrap().seconds, 90);
        assert_eq!(RepeatInterval::parse("+2 hours").unwrap().seconds, 7_200);
        assert_eq!(
            RepeatInterval::parse("1 day 6 hours").unwrap().seconds,
            86_400 + 6 * 3_600
        );
        assert_eq!(RepeatInterval::parse("2 years").unwrap().months, 24);
    }

    #[test]
    fn garbage_is_rejected() {
        for bad in [
            "",
            "soon",
            "1",
            "day 1",
            "0 days",
            "-1 day",
            "3 fortnights",
            "400000000 years",
            "4294967295 months 4294967295 months",
            "4294967295 weeks 4294967295 weeks 4294967295 weeks 4294967295 weeks",
            "4294967295 weeks",
            "9000 years",
        ] {
            assert!(RepeatInterval::parse(bad).is_err(), "input: {bad:?}");
        }
    }

    #[test]
    fn daily_adds_one_day() {
        let from = at(2026, 3, 10);
        assert_eq!(next_run("daily", from).unwrap(), from + Duration::days(1));
    }

    #[test]
    fn monthly_is_calendar_aware() {
        let next = next_run("monthly", at(2026, 1, 31)).unwrap();
        assert_eq!(next, at(2026, 2, 28));

        let next = next_run("quarterly", at(2026, 11, 15)).unwrap();
        assert_eq!(next, at(2027, 2, 15));
    }
}
