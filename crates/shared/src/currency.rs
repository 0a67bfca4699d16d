//! Currency metadata
//!
//! Amounts are stored as integers in the currency's smallest unit. The exponent
//! is the number of decimal places a currency is rounded to before conversion.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// ISO 4217 currencies supported for billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
    Cad,
    Aud,
    Chf,
    Inr,
    Brl,
    Jpy,
    Krw,
    Bhd,
    Kwd,
    Jod,
}

impl Default for Currency {
    fn default() -> Self {
        Self::Usd
    }
}

impl Currency {
    /// Number of decimal places amounts are rounded to
    pub fn exponent(&self) -> u32 {
        match self {
            Self::Jpy | Self::Krw => 0,
            Self::Bhd | Self::Kwd | Self::Jod => 3,
            _ => 2,
        }
    }

    /// Smallest units per major unit (100 for USD cents)
    pub fn subunit_multiplier(&self) -> i64 {
        10_i64.pow(self.exponent())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Usd => "USD",
            Self::Eur => "EUR",
            Self::Gbp => "GBP",
            Self::Cad => "CAD",
            Self::Aud => "AUD",
            Self::Chf => "CHF",
            Self::Inr => "INR",
            Self::Brl => "BRL",
            Self::Jpy => "JPY",
            Self::Krw => "KRW",
            Self::Bhd => "BHD",
            Self::Kwd => "KWD",
            Self::Jod => "JOD",
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl std::str::FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "USD" => Ok(Self::Usd),
            "EUR" => Ok(Self::Eur),
            "GBP" => Ok(Self::Gbp),
            "CAD" => Ok(Self::Cad),
            "AUD" => Ok(Self::Aud),
            "CHF" => Ok(Self::Chf),
            "INR" => Ok(Self::Inr),
            "BRL" => Ok(Self::Brl),
            "JPY" => Ok(Self::Jpy),
            "KRW" => Ok(Self::Krw),
            "BHD" => Ok(Self::Bhd),
            "KWD" => Ok(Self::Kwd),
            "JOD" => Ok(Self::Jod),
            _ => Err(DomainError::UnknownCurrency(s.to_string())),
        }
    }
}
