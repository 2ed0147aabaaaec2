//! Duration strings used by pause steps and experiments
//!
//! Accepts `"30s"`, `"5m"`, `"1h"` or a bare number of seconds (`"45"`).

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration string")]
    Empty,

    #[error("invalid duration number in {0:?}")]
    InvalidNumber(String),

    #[error("unsupported duration unit in {0:?} (expected s, m or h)")]
    InvalidUnit(String),
}

/// Parse a duration string into a `Duration`
///
/// Zero is valid: a zero-length pause completes on the next evaluation.
pub fn parse_duration(value: &str) -> Result<Duration, DurationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(DurationError::Empty);
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);

    let amount: u64 = number
        .parse()
        .map_err(|_| DurationError::InvalidNumber(value.to_string()))?;

    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(DurationError::InvalidUnit(value.to_string())),
    };

    amount
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| DurationError::InvalidNumber(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
    }

    #[test]
    fn test_parse_duration_zero_is_valid() {
        assert_eq!(parse_duration("0s"), Ok(Duration::ZERO));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert!(matches!(
            parse_duration("s"),
            Err(DurationError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_duration("10d"),
            Err(DurationError::InvalidUnit(_))
        ));
        assert!(matches!(
            parse_duration("1.5m"),
            Err(DurationError::InvalidUnit(_))
        ));
    }
}
