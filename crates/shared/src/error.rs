//! Error types for meterbill domain records

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
