use thiserror::Error;

/// Validation and contract errors exposed by `crosslist-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("provider id cannot be empty")]
    EmptyProviderId,
    #[error("provider id length {len} exceeds max {max}")]
    ProviderIdTooLong { len: usize, max: usize },
    #[error("provider id contains invalid character '{ch}' at index {index}")]
    ProviderIdInvalidChar { ch: char, index: usize },

    #[error("timestamp must be RFC3339, e.g. 2024-01-01T00:00:00Z: '{value}'")]
    InvalidTimestamp { value: String },
    #[error("date range start must not be after its end")]
    InvertedDateRange,

    #[error("field '{field}' cannot be empty")]
    EmptyField { field: &'static str },
    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be greater than zero")]
    NonPositiveValue { field: &'static str },
    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },
    #[error("invalid item condition '{value}', expected one of New, Like New, Excellent, Good, Fair, Poor")]
    InvalidCondition { value: String },

    #[error("setting '{field}' is out of range: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
