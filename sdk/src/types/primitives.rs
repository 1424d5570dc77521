//! Primitive types for the Marketfeed SDK.
//!
//! Provides the trade side and helpers for reading exchange-native numeric
//! and time fields.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::SdkError;

/// Trade side, from the taker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Taker bought.
    Buy,
    /// Taker sold.
    Sell,
}

impl Side {
    /// Returns the opposite side.
    #[must_use]
    pub const fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for Side {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "bid" => Ok(Self::Buy),
            "sell" | "ask" => Ok(Self::Sell),
            _ => Err(SdkError::InvalidSide(s.to_string())),
        }
    }
}

/// Reads a decimal from a JSON number or numeric string.
///
/// Exchanges disagree on whether prices travel as `"3407.43"` or `3407.43`;
/// both are accepted. Numbers go through their textual form so no binary
/// float rounding leaks into the book.
///
/// # Errors
///
/// Returns `SdkError::Deserialization` if the value is neither.
pub fn decimal_from_json(value: &serde_json::Value) -> Result<Decimal, SdkError> {
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => return Err(SdkError::Deserialization(format!("not a number: {other}"))),
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| SdkError::Deserialization(format!("not a decimal: {text}")))
}

/// Parses an RFC 3339 / ISO 8601 timestamp into milliseconds since epoch.
///
/// # Errors
///
/// Returns `SdkError::InvalidTimestamp` if the string cannot be parsed.
pub fn millis_from_rfc3339(text: &str) -> Result<i64, SdkError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| SdkError::InvalidTimestamp(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_side_display() {
        assert_eq!(Side::Buy.to_string(), "buy");
        assert_eq!(Side::Sell.to_string(), "sell");
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_side_from_str() {
        assert_eq!("BUY".parse::<Side>(), Ok(Side::Buy));
        assert_eq!("ask".parse::<Side>(), Ok(Side::Sell));
        assert!("hold".parse::<Side>().is_err());
    }

    #[test]
    fn test_side_serde() {
        let json = serde_json::to_string(&Side::Sell).expect("serialize");
        assert_eq!(json, "\"sell\"");
    }

    #[test]
    fn test_decimal_from_string() {
        let value = decimal_from_json(&json!("3407.43")).expect("decimal");
        assert_eq!(value, dec!(3407.43));
    }

    #[test]
    fn test_decimal_from_number() {
        let value = decimal_from_json(&json!(0.06388482)).expect("decimal");
        assert_eq!(value, dec!(0.06388482));

        let value = decimal_from_json(&json!(101)).expect("decimal");
        assert_eq!(value, dec!(101));
    }

    #[test]
    fn test_decimal_rejects_other_types() {
        assert!(decimal_from_json(&json!(null)).is_err());
        assert!(decimal_from_json(&json!("abc")).is_err());
        assert!(decimal_from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_millis_from_rfc3339() {
        let ms = millis_from_rfc3339("2019-03-06T23:03:12.860Z").expect("timestamp");
        assert_eq!(ms, 1_551_913_392_860);
        assert!(millis_from_rfc3339("yesterday").is_err());
    }
}
