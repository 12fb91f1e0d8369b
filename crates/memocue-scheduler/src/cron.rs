//! Cron expression support on top of the `cron` crate.
//! Accepts classic 5-field "MIN HOUR DOM MON DOW" as well as the 6/7-field
//! form with seconds (and year). Evaluation is timezone-aware.
//!
//! Example: "0 8 * * 1-5" = weekdays at 08:00 local time.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

const WEEKDAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Parse an expression into a `cron::Schedule`, logging why it was rejected.
pub fn parse(expression: &str) -> Option<cron::Schedule> {
    let Some(normalized) = normalize(expression) else {
        tracing::warn!(
            "Invalid cron expression: '{}' (need 5, 6 or 7 fields)",
            expression
        );
        return None;
    };
    match cron::Schedule::from_str(&normalized) {
        Ok(schedule) => Some(schedule),
        Err(e) => {
            tracing::warn!("Invalid cron expression: '{}': {}", expression, e);
            None
        }
    }
}

/// Next fire time strictly after `after`, evaluated in `tz`.
pub fn next_after(expression: &str, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let schedule = parse(expression)?;
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| *t > after)
}

/// Bring an expression into the seconds-first form the `cron` crate reads.
///
/// Five-field expressions use Unix day-of-week numbering (0 or 7 = Sunday),
/// which is rewritten to names so it cannot be confused with the crate's
/// 1 = Sunday numbering.
fn normalize(expression: &str) -> Option<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = unix_dow_to_names(fields[4])?;
            Some(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Some(fields.join(" ")),
        _ => None,
    }
}

/// Rewrite "1-5", "0,6", "*/2", "1-5/2" into weekday names.
fn unix_dow_to_names(field: &str) -> Option<String> {
    let mut parts = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let range = if range == "*" || range == "?" {
            range.to_string()
        } else {
            range
                .split('-')
                .map(weekday_name)
                .collect::<Option<Vec<_>>>()?
                .join("-")
        };
        parts.push(match step {
            Some(step) => format!("{range}/{step}"),
            None => range,
        });
    }
    Some(parts.join(","))
}

fn weekday_name(token: &str) -> Option<String> {
    match token.parse::<usize>() {
        Ok(n) if n <= 7 => Some(WEEKDAY_NAMES[n % 7].to_string()),
        Ok(_) => None,
        Err(_) => Some(token.to_string()),
    }
}
