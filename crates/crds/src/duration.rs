//! Duration strings used by `lifecycle.timeToLive`.
//!
//! Accepted form is a sequence of `<integer><unit>` components where unit is
//! one of `s`, `m`, `h`, `d` (e.g. `45s`, `90m`, `1h30m`, `2d`).

use crate::error::CrdError;
use chrono::Duration;

/// Parse a duration string such as `4h` or `1h30m`.
pub fn parse_duration(input: &str) -> Result<Duration, CrdError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CrdError::Duration(input.to_string(), "empty duration".to_string()));
    }

    let mut total = Duration::zero();
    let mut digits = String::new();

    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }

        if digits.is_empty() {
            return Err(CrdError::Duration(
                input.to_string(),
                format!("unit '{}' must follow a number", ch),
            ));
        }

        let value: i64 = digits
            .parse()
            .map_err(|_| CrdError::Duration(input.to_string(), "number out of range".to_string()))?;
        digits.clear();

        let component = match ch {
            's' => Duration::try_seconds(value),
            'm' => Duration::try_minutes(value),
            'h' => Duration::try_hours(value),
            'd' => Duration::try_days(value),
            other => {
                return Err(CrdError::Duration(
                    input.to_string(),
                    format!("unknown unit '{}'", other),
                ));
            }
        }
        .ok_or_else(|| CrdError::Duration(input.to_string(), "duration out of range".to_string()))?;

        total = total
            .checked_add(&component)
            .ok_or_else(|| CrdError::Duration(input.to_string(), "duration out of range".to_string()))?;
    }

    if !digits.is_empty() {
        return Err(CrdError::Duration(
            input.to_string(),
            "missing unit after trailing number".to_string(),
        ));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_units() {
        assert_eq!(parse_duration("45s").unwrap(), Duration::seconds(45));
        assert_eq!(parse_duration("90m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("4h").unwrap(), Duration::hours(4));
        assert_eq!(parse_duration("2d").unwrap(), Duration::days(2));
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::minutes(90)
        );
        assert_eq!(
            parse_duration("1d2h3m4s").unwrap(),
            Duration::seconds(86_400 + 7_200 + 180 + 4)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10w").is_err());
        assert!(parse_duration("-1h").is_err());
    }
}
