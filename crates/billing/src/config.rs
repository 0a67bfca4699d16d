//! Billing engine configuration

use chrono_tz::Tz;
use meterbill_shared::parse_timezone;

use crate::error::{BillingError, BillingResult};

/// Configuration for the billing engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Timezone used when neither the customer nor the organization sets one
    pub default_timezone: Tz,
    /// Keep fee lines whose amount is zero (needed for audit of empty periods)
    pub emit_zero_fees: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timezone: chrono_tz::UTC,
            emit_zero_fees: true,
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables
    ///
    /// - `BILLING_DEFAULT_TIMEZONE`: IANA timezone name (default: UTC)
    /// - `BILLING_EMIT_ZERO_FEES`: "true"/"false" (default: true)
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_timezone = match lookup("BILLING_DEFAULT_TIMEZONE") {
            Some(name) => parse_timezone(name.trim())
                .map_err(|e| BillingError::Config(e.to_string()))?,
            None => chrono_tz::UTC,
        };

        let emit_zero_fees = match lookup("BILLING_EMIT_ZERO_FEES") {
            Some(v) => match v.trim().to_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                other => {
                    return Err(BillingError::Config(format!(
                        "BILLING_EMIT_ZERO_FEES must be true or false, got {}",
                        other
                    )))
                }
            },
            None => true,
        };

        Ok(Self {
            default_timezone,
            emit_zero_fees,
        })
    }
}
