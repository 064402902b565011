//! When a query runs.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local};

/// Minimum allowed interval (1 second).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Schedule for query execution.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Fixed interval between runs, clamped to [`MIN_INTERVAL`].
    Interval(Duration),

    /// Cron expression evaluated in local time.
    Cron(CronSchedule),

    /// Run on every scrape.
    OnDemand,
}

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// The expression as configured.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: &DateTime<Local>) -> Option<DateTime<Local>> {
        self.schedule.after(now).next()
    }
}

impl Schedule {
    /// Create an interval schedule.
    ///
    /// Interval is clamped to a minimum of 1 second.
    pub fn interval(duration: Duration) -> Self {
        if duration < MIN_INTERVAL {
            tracing::warn!(min_interval = ?MIN_INTERVAL,
                "Interval duration is less than minimum allowed. Using minimum duration."
            );
            Self::Interval(MIN_INTERVAL)
        } else {
            Self::Interval(duration)
        }
    }

    /// Create a cron schedule.
    ///
    /// Standard 5-field expressions (`min hour day month weekday`) are
    /// accepted and fire at second 0. Their weekdays count from Sunday as 0
    /// (7 is Sunday too). 6- and 7-field expressions are used as is, with
    /// the `cron` crate's numbering (Sunday is 1).
    ///
    /// # Errors
    /// Returns the parse error if the expression is invalid.
    pub fn cron(expr: impl AsRef<str>) -> Result<Self, cron::error::Error> {
        let expr = expr.as_ref().trim();
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let schedule = if let [minute, hour, day, month, weekday] = fields[..] {
            let weekday = standard_weekdays(weekday);
            cron::Schedule::from_str(&format!("0 {minute} {hour} {day} {month} {weekday}"))?
        } else {
            cron::Schedule::from_str(expr)?
        };
        Ok(Self::Cron(CronSchedule {
            expr: expr.to_string(),
            schedule,
        }))
    }

    pub fn is_scheduled(&self) -> bool {
        !matches!(self, Self::OnDemand)
    }

    /// Nominal period reported by the `query_interval` builtin metric.
    /// Cron schedules report the gap between their next two fire times.
    pub fn period(&self, now: &DateTime<Local>) -> Option<Duration> {
        match self {
            Self::Interval(d) => Some(*d),
            Self::Cron(cron) => {
                let mut upcoming = cron.schedule.after(now);
                let first = upcoming.next()?;
                let second = upcoming.next()?;
                (second - first).to_std().ok()
            }
            Self::OnDemand => None,
        }
    }
}

/// Rewrite a standard weekday field (Sunday = 0 or 7) to the numbering of
/// the `cron` crate (Sunday = 1). Names and `*` are left alone. A range
/// ending on 7 is split so that it wraps onto Sunday.
fn standard_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let shift = |day: &str| match day.parse::<u32>() {
                Ok(0 | 7) => "1".to_string(),
                Ok(n) => (n + 1).to_string(),
                Err(_) => day.to_string(),
            };
            let mut out = match range.split_once('-') {
                Some((start, "7")) if step.is_none() => match start.parse::<u32>() {
                    Ok(n) if n < 7 => format!("{}-7,1", n + 1),
                    _ => format!("{}-{}", shift(start), shift("7")),
                },
                Some((start, end)) => format!("{}-{}", shift(start), shift(end)),
                None => shift(range),
            };
            if let Some(step) = step {
                out.push('/');
                out.push_str(step);
            }
            out
        })
        .collect::<Vec<_>>()
        .join(",")
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(d) => write!(f, "every {}", humantime::format_duration(*d)),
            Self::Cron(cron) => write!(f, "cron: {}", cron.expr),
            Self::OnDemand => write!(f, "on demand"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_interval_clamped() {
        let schedule = Schedule::interval(Duration::from_millis(100));
        assert!(matches!(schedule, Schedule::Interval(d) if d == MIN_INTERVAL));

        let schedule = Schedule::interval(Duration::from_secs(30));
        assert!(matches!(schedule, Schedule::Interval(d) if d == Duration::from_secs(30)));
    }

    #[test]
    fn test_cron_five_fields() {
        let schedule = Schedule::cron("*/5 * * * *").unwrap();
        let Schedule::Cron(cron) = &schedule else {
            panic!("expected cron schedule");
        };
        assert_eq!(cron.expr(), "*/5 * * * *");

        let now = Local.with_ymd_and_hms(2024, 3, 1, 10, 2, 30).unwrap();
        let next = cron.next_after(&now).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 5, 0));
    }

    #[test]
    fn test_cron_weekdays_count_from_sunday() {
        // Sunday 2024-03-03
        let sunday = Local.with_ymd_and_hms(2024, 3, 3, 8, 0, 0).unwrap();
        let next_day = |expr: &str| {
            let Schedule::Cron(cron) = Schedule::cron(expr).unwrap() else {
                panic!("expected cron schedule");
            };
            cron.next_after(&sunday).unwrap().weekday()
        };

        assert_eq!(next_day("0 9 * * 1"), Weekday::Mon);
        assert_eq!(next_day("0 9 * * 0"), Weekday::Sun);
        assert_eq!(next_day("0 9 * * 7"), Weekday::Sun);
        assert_eq!(next_day("0 9 * * 6"), Weekday::Sat);
        assert_eq!(next_day("0 9 * * 1-5"), Weekday::Mon);
        assert_eq!(next_day("0 9 * * 5-7"), Weekday::Sun);
        assert_eq!(next_day("0 9 * * 3,5"), Weekday::Wed);
        assert_eq!(next_day("0 9 * * Mon-Fri"), Weekday::Mon);
    }

    #[test]
    fn test_standard_weekdays() {
        assert_eq!(standard_weekdays("*"), "*");
        assert_eq!(standard_weekdays("0"), "1");
        assert_eq!(standard_weekdays("1-5"), "2-6");
        assert_eq!(standard_weekdays("0,6"), "1,7");
        assert_eq!(standard_weekdays("4-7"), "5-7,1");
        assert_eq!(standard_weekdays("0-6/2"), "1-7/2");
        assert_eq!(standard_weekdays("SUN"), "SUN");
    }

    #[test]
    fn test_cron_six_fields() {
        let schedule = Schedule::cron("30 * * * * *").unwrap();
        let Schedule::Cron(cron) = &schedule else {
            panic!("expected cron schedule");
        };
        let now = Local.with_ymd_and_hms(2024, 3, 1, 10, 2, 0).unwrap();
        let next = cron.next_after(&now).unwrap();
        assert_eq!((next.minute(), next.second()), (2, 30));
    }

    #[test]
    fn test_cron_invalid() {
        assert!(Schedule::cron("not a cron").is_err());
        assert!(Schedule::cron("99 * * * *").is_err());
    }

    #[test]
    fn test_period() {
        let now = Local.with_ymd_and_hms(2024, 3, 1, 10, 2, 30).unwrap();
        let cron = Schedule::cron("*/5 * * * *").unwrap();
        assert_eq!(cron.period(&now), Some(Duration::from_secs(300)));
        assert_eq!(
            Schedule::interval(Duration::from_secs(10)).period(&now),
            Some(Duration::from_secs(10))
        );
        assert_eq!(Schedule::OnDemand.period(&now), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Schedule::interval(Duration::from_secs(30)).to_string(), "every 30s");
        assert_eq!(Schedule::cron("0 * * * *").unwrap().to_string(), "cron: 0 * * * *");
        assert_eq!(Schedule::OnDemand.to_string(), "on demand");
    }
}
