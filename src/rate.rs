use std::fmt;
use std::str::FromStr;

use crate::errors::{RateThrottleError, Result};

/// A parsed shorthand rate declaration such as `"100/minute"`.
///
/// The grammar is `<N>/<unit>` with unit one of second, minute, hour or
/// day (common abbreviations and plurals accepted). Parsing is
/// case-insensitive and whitespace-tolerant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    /// Maximum number of requests allowed per window.
    pub limit: u64,
    /// Window length in seconds.
    pub window: u64,
}

/// Parse a shorthand rate declaration into `(limit, window_seconds)`.
pub fn parse_rate(expr: &str) -> Result<(u64, u64)> {
    let rate: Rate = expr.parse()?;
    Ok((rate.limit, rate.window))
}

/// Render `(limit, window_seconds)` in the canonical shorthand form.
pub fn format_rate(limit: u64, window: u64) -> String {
    Rate { limit, window }.to_string()
}

impl FromStr for Rate {
    type Err = RateThrottleError;

    fn from_str(s: &str) -> Result<Self> {
        let (limit_part, unit_part) = s.trim().split_once('/').ok_or_else(|| {
            RateThrottleError::InvalidRate(format!("'{}' is missing the '/' separator", s))
        })?;

        let limit: u64 = limit_part.trim().parse().map_err(|_| {
            RateThrottleError::InvalidRate(format!("'{}' is not a valid limit", limit_part.trim()))
        })?;

        if limit == 0 {
            return Err(RateThrottleError::InvalidRate(
                "limit must be positive".to_string(),
            ));
        }

        let unit = unit_part.trim().to_ascii_lowercase();
        let window = match unit.as_str() {
            "second" | "seconds" | "sec" | "secs" | "s" => 1,
            "minute" | "minutes" | "min" | "mins" | "m" => 60,
            "hour" | "hours" | "hr" | "hrs" | "h" => 3600,
            "day" | "days" | "d" => 86_400,
            other => {
                return Err(RateThrottleError::InvalidRate(format!(
                    "unknown time unit '{}'",
                    other
                )))
            }
        };

        Ok(Rate { limit, window })
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.window {
            1 => "second",
            60 => "minute",
            3600 => "hour",
            86_400 => "day",
            // Windows outside the shorthand grammar render with an
            // explicit second count.
            other => return write!(f, "{}/{}s", self.limit, other),
        };
        write!(f, "{}/{}", self.limit, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_named_units() {
        assert_eq!(parse_rate("100/minute").unwrap(), (100, 60));
        assert_eq!(parse_rate("5/second").unwrap(), (5, 1));
        assert_eq!(parse_rate("1000/hour").unwrap(), (1000, 3600));
        assert_eq!(parse_rate("20/day").unwrap(), (20, 86_400));
    }

    #[test]
    fn test_parse_abbreviations_and_case() {
        assert_eq!(parse_rate("10/s").unwrap(), (10, 1));
        assert_eq!(parse_rate("10/Min").unwrap(), (10, 60));
        assert_eq!(parse_rate("10/HOURS").unwrap(), (10, 3600));
        assert_eq!(parse_rate("  10 / d  ").unwrap(), (10, 86_400));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_rate("100").is_err());
        assert!(parse_rate("abc/minute").is_err());
        assert!(parse_rate("0/minute").is_err());
        assert!(parse_rate("100/fortnight").is_err());
        assert!(parse_rate("").is_err());
    }

    #[test]
    fn test_round_trip_is_canonical() {
        for expr in ["100/minute", "5/second", "1000/hour", "3/day"] {
            let rate: Rate = expr.parse().unwrap();
            assert_eq!(rate.to_string(), expr);
        }
        // Abbreviations normalize to the canonical unit name.
        let rate: Rate = "10/secs".parse().unwrap();
        assert_eq!(rate.to_string(), "10/second");
    }
}
