//! Cron expression evaluation
//!
//! Standard 5-field expressions (minute, hour, day-of-month, month, day-of-week) are
//! translated into the 6-field, seconds-first dialect of the `cron` crate. Day-of-week
//! numbers follow the Unix convention (0 or 7 = Sunday) and are shifted onto the
//! crate's 1-7 range. When both day fields are restricted the expression fires if
//! either matches, as Vixie cron does.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::Serialize;

use crate::error::{AppError, AppResult};

const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];

/// A parsed, validated 5-field cron expression
#[derive(Clone, Debug)]
pub struct CronExpression {
    source: String,
    schedules: Vec<Schedule>,
}

impl CronExpression {
    pub fn parse(expression: &str) -> AppResult<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(AppError::schedule(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let (minute, hour, dom, month, dow) = (fields[0], fields[1], fields[2], fields[3], fields[4]);
        let dow = normalize_day_of_week(dow)
            .map_err(|reason| AppError::schedule(expression, reason))?;

        let variants = if is_restricted(dom) && is_restricted(&dow) {
            vec![
                format!("0 {} {} {} {} *", minute, hour, dom, month),
                format!("0 {} {} * {} {}", minute, hour, month, dow),
            ]
        } else {
            vec![format!("0 {} {} {} {} {}", minute, hour, dom, month, dow)]
        };

        let mut schedules = Vec::with_capacity(variants.len());
        for variant in variants {
            let schedule = Schedule::from_str(&variant)
                .map_err(|e| AppError::schedule(expression, locate_error(&fields, e.to_string())))?;
            schedules.push(schedule);
        }

        Ok(Self {
            source: expression.trim().to_string(),
            schedules,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|s| s.after(&after).next())
            .min()
    }

    /// The next `count` fire times strictly after `after`
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        while times.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    times.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        times
    }

    /// Whether a fire time later than `last_run` falls inside `[now - window, now]`
    pub fn is_due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>, window_seconds: u64) -> bool {
        let Some(last_run) = last_run else {
            return true;
        };
        // A window reaching past the representable range covers all of history
        let window_start = i64::try_from(window_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        // Fire times land on whole seconds; step back one so a fire exactly at window_start counts.
        let search_from = std::cmp::max(
            last_run,
            window_start
                .checked_sub_signed(Duration::seconds(1))
                .unwrap_or(window_start),
        );

        let mut cursor = search_from;
        loop {
            match self.next_after(cursor) {
                Some(t) if t < window_start => cursor = t,
                Some(t) => return t > last_run && t <= now,
                None => return false,
            }
        }
    }
}

fn is_restricted(field: &str) -> bool {
    field != "*" && field != "?"
}

/// Map Unix day-of-week numbers (0-7, Sunday = 0 or 7) onto the `cron` crate's 1-7 range
/// (Sunday = 1). Names such as `MON-FRI` pass through untouched.
fn normalize_day_of_week(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let step_suffix = step.map(|s| format!("/{}", s)).unwrap_or_default();

        if range == "*" || range == "?" || !range.chars().next().map_or(false, |c| c.is_ascii_digit()) {
            items.push(format!("{}{}", range, step_suffix));
            continue;
        }

        let parse = |s: &str| -> Result<u32, String> {
            let value: u32 = s
                .parse()
                .map_err(|_| format!("day-of-week: '{}' is not a number", s))?;
            if value > 7 {
                return Err(format!("day-of-week: {} is out of range 0-7", value));
            }
            Ok(value)
        };

        match range.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(format!("day-of-week: range {}-{} is reversed", start, end));
                }
                if let Some(step) = step {
                    // Expand so a step landing on 7 still means Sunday
                    let step: usize = match step.parse() {
                        Ok(n) if n > 0 => n,
                        _ => return Err(format!("day-of-week: invalid step '{}'", step)),
                    };
                    let mut days: Vec<u32> = (start..=end).step_by(step).map(|d| d % 7 + 1).collect();
                    days.sort_unstable();
                    days.dedup();
                    items.extend(days.iter().map(|d| d.to_string()));
                } else if end == 7 && start > 0 {
                    // Saturday..Sunday wraps past the end of the crate's range
                    if start == 7 {
                        items.push("1".to_string());
                    } else {
                        items.push(format!("{}-7", start + 1));
                        items.push("1".to_string());
                    }
                } else {
                    items.push(format!("{}-{}", start % 7 + 1, (end % 7) + 1));
                }
            }
            None => {
                let value = parse(range)?;
                items.push(format!("{}{}", value % 7 + 1, step_suffix));
            }
        }
    }
    Ok(items.join(","))
}

/// Attach the offending field name to a `cron` crate parse error where it can be inferred
fn locate_error(fields: &[&str], error: String) -> String {
    for (name, field) in FIELD_NAMES.iter().zip(fields) {
        if *field != "*" && error.contains(field) {
            return format!("{} field '{}': {}", name, field, error);
        }
    }
    error
}

/// Result of validating an expression; never an error
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CronValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_runs: Option<Vec<String>>,
}

pub fn validate(expression: &str) -> CronValidation {
    validate_at(expression, Utc::now())
}

pub fn validate_at(expression: &str, now: DateTime<Utc>) -> CronValidation {
    match CronExpression::parse(expression) {
        Ok(cron) => CronValidation {
            valid: true,
            description: Some(describe(expression)),
            error: None,
            next_runs: Some(
                cron.upcoming(now, 5)
                    .into_iter()
                    .map(|dt| dt.to_rfc3339())
                    .collect(),
            ),
        },
        Err(e) => CronValidation {
            valid: false,
            description: None,
            error: Some(match e.details {
                Some(reason) => format!("{}: {}", e.message, reason),
                None => e.message,
            }),
            next_runs: None,
        },
    }
}

/// Next fire time after `after`, or `None` for an invalid expression
pub fn next_fire_time(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    CronExpression::parse(expression).ok()?.next_after(after)
}

/// Invalid expressions are never due
pub fn is_due(
    expression: &str,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window_seconds: u64,
) -> bool {
    CronExpression::parse(expression)
        .map(|cron| cron.is_due(last_run, now, window_seconds))
        .unwrap_or(false)
}

/// Human-readable description for common expressions
pub fn describe(expression: &str) -> String {
    let normalized = expression.split_whitespace().collect::<Vec<_>>().join(" ");
    match normalized.as_str() {
        "* * * * *" => return "Every minute".to_string(),
        "0 * * * *" => return "Every hour".to_string(),
        "0 0 * * *" => return "Daily at midnight".to_string(),
        "0 9 * * 1" => return "Mondays at 9am".to_string(),
        "0 9 * * 1-5" => return "Weekdays at 9am".to_string(),
        _ => {}
    }

    let fields: Vec<&str> = normalized.split(' ').collect();
    if fields.len() != 5 {
        return normalized;
    }
    let rest_any = fields[2] == "*" && fields[3] == "*" && fields[4] == "*";

    if let Some(n) = fields[0].strip_prefix("*/") {
        if fields[1] == "*" && rest_any {
            return format!("Every {} minutes", n);
        }
    }
    if let Some(n) = fields[1].strip_prefix("*/") {
        if fields[0] == "0" && rest_any {
            return format!("Every {} hours", n);
        }
    }
    if let (Ok(minute), Ok(hour)) = (fields[0].parse::<u32>(), fields[1].parse::<u32>()) {
        let at = format!("{:02}:{:02}", hour, minute);
        if rest_any {
            return format!("Daily at {}", at);
        }
        if fields[2] == "*" && fields[3] == "*" && fields[4] == "1-5" {
            return format!("Weekdays at {}", at);
        }
        if fields[3] == "*" && fields[4] == "*" {
            return format!("Monthly on day {} at {}", fields[2], at);
        }
    }

    normalized
}
