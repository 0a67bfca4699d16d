//! Billing error types

use meterbill_shared::{ChargeId, DomainError};
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid properties for {model} charge {charge_id}: {reason}")]
    InvalidChargeProperties {
        charge_id: ChargeId,
        model: &'static str,
        reason: String,
    },

    #[error("Amount {0} does not fit in integer cents")]
    AmountOverflow(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

pub type BillingResult<T> = Result<T, BillingError>;
