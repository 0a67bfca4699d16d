//! Conversion of decimal amounts to currency subunits

use meterbill_shared::{Currency, Fee};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{BillingError, BillingResult};

/// An amount expressed in currency subunits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cents {
    /// Rounded to the currency exponent
    pub amount_cents: i64,
    /// Unrounded, keeps the full precision of the computation
    pub precise_amount_cents: Decimal,
}

/// Convert a major-unit amount to subunits, rounding half away from zero
/// at the currency's exponent
pub fn to_cents(amount: Decimal, currency: Currency) -> BillingResult<Cents> {
    let multiplier = Decimal::from(currency.subunit_multiplier());
    let rounded = amount.round_dp_with_strategy(
        currency.exponent(),
        RoundingStrategy::MidpointAwayFromZero,
    );

    let amount_cents = rounded
        .checked_mul(multiplier)
        .and_then(|c| c.to_i64())
        .ok_or_else(|| BillingError::AmountOverflow(amount.to_string()))?;
    let precise_amount_cents = amount
        .checked_mul(multiplier)
        .ok_or_else(|| BillingError::AmountOverflow(amount.to_string()))?;

    Ok(Cents {
        amount_cents,
        precise_amount_cents,
    })
}

/// Round a subunit amount to a whole number of subunits
pub fn round_cents(precise_cents: Decimal) -> BillingResult<i64> {
    precise_cents
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| BillingError::AmountOverflow(precise_cents.to_string()))
}

/// Total of the fees' rounded amounts
pub fn sum_cents<'a>(fees: impl IntoIterator<Item = &'a Fee>) -> BillingResult<i64> {
    fees.into_iter().try_fold(0i64, |total, fee| {
        total
            .checked_add(fee.amount_cents)
            .ok_or_else(|| BillingError::AmountOverflow(format!("{} + {}", total, fee.amount_cents)))
    })
}

/// Amount missing to reach `target`, never negative
pub fn shortfall(target: i64, actual: i64) -> i64 {
    target.saturating_sub(actual).max(0)
}
