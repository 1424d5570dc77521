//! SDK error types.
//!
//! Provides error types for SDK operations.

/// SDK errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SdkError {
    /// Symbol is not of the form `BASE/QUOTE`.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Invalid price value.
    #[error("invalid price: {0}")]
    InvalidPrice(String),

    /// Invalid size value.
    #[error("invalid size: {0}")]
    InvalidSize(String),

    /// Invalid side value.
    #[error("invalid side: {0}")]
    InvalidSide(String),

    /// Invalid timestamp value.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
