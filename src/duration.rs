//! Age parsing for `--min-age` / `--max-age`.
//!
//! Accepts an integer with one of the suffixes `s`, `min`, `h`, `d`, `w`,
//! `mon`, `y`. Months count 30 days, years 365; ages are coarse filters,
//! not calendar arithmetic.

use chrono::{DateTime, Duration, Utc};

use crate::error::DiffError;

/// Parse an age like `5min` or `2d` into a duration.
pub fn parse_age(text: &str) -> Result<Duration, DiffError> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid(text))?;
    let (digits, suffix) = text.split_at(split);
    let value: i64 = digits.parse().map_err(|_| invalid(text))?;
    let seconds = match suffix {
        "s" => 1,
        "min" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        "mon" => 30 * 86_400,
        "y" => 365 * 86_400,
        _ => return Err(invalid(text)),
    };
    Ok(Duration::seconds(value * seconds))
}

/// An age bound as an absolute instant: `now - age`.
pub fn age_to_instant(age: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, DiffError> {
    Ok(now - parse_age(age)?)
}

fn invalid(text: &str) -> DiffError {
    DiffError::InvalidArgument(format!(
        "invalid age {text:?} (expected e.g. 30s, 5min, 2h, 1d, 1w, 1mon, 1y)"
    ))
}
