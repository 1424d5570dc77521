//! Symbol and exchange identifiers.
//!
//! A [`Symbol`] is the canonical `BASE/QUOTE` form every adapter translates
//! into; an [`ExchangeId`] names one configured exchange connection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SdkError;

/// Canonical instrument symbol (e.g., "BTC/EUR").
///
/// Both legs are stored upper-case so that `btc/eur` and `BTC/EUR` compare
/// equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol {
    base: String,
    quote: String,
}

impl Symbol {
    /// Creates a symbol from its base and quote currencies.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::InvalidSymbol` if either leg is empty or contains
    /// a `/`.
    pub fn new(base: impl AsRef<str>, quote: impl AsRef<str>) -> Result<Self, SdkError> {
        let base = base.as_ref().trim();
        let quote = quote.as_ref().trim();

        if base.is_empty() || quote.is_empty() || base.contains('/') || quote.contains('/') {
            return Err(SdkError::InvalidSymbol(format!("{base}/{quote}")));
        }

        Ok(Self {
            base: base.to_ascii_uppercase(),
            quote: quote.to_ascii_uppercase(),
        })
    }

    /// Returns the base currency.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Returns the quote currency.
    #[must_use]
    pub fn quote(&self) -> &str {
        &self.quote
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for Symbol {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| SdkError::InvalidSymbol(s.to_string()))?;
        Self::new(base, quote)
    }
}

impl TryFrom<&str> for Symbol {
    type Error = SdkError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Exchange identifier (e.g., "cex", "bitstamp").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(String);

impl ExchangeId {
    /// Creates a new exchange identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ExchangeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
