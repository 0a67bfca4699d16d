//! Pricing models
//!
//! [`apply`] turns an aggregated quantity into an amount in major currency
//! units for every [`ChargeModel`] variant. Model properties are validated
//! before pricing; malformed properties are an error, not a zero amount.

use meterbill_shared::{AmountDetails, ChargeId, ChargeModel, PercentageRange, PriceRange, RangeDetail};
use rust_decimal::Decimal;

use crate::aggregation::Quantity;
use crate::error::{BillingError, BillingResult};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Outcome of pricing a quantity
#[derive(Debug, Clone, PartialEq)]
pub struct PricedAmount {
    /// Amount in major currency units, unrounded
    pub amount: Decimal,
    /// `amount / units`, zero when there are no units
    pub unit_amount: Decimal,
    pub amount_details: AmountDetails,
}

impl PricedAmount {
    fn new(amount: Decimal, units: Decimal, amount_details: AmountDetails) -> Self {
        let unit_amount = if units.is_zero() {
            Decimal::ZERO
        } else {
            amount / units
        };
        Self {
            amount,
            unit_amount,
            amount_details,
        }
    }

    fn zero() -> Self {
        Self::new(Decimal::ZERO, Decimal::ZERO, AmountDetails::None)
    }
}

fn mul(a: Decimal, b: Decimal) -> BillingResult<Decimal> {
    a.checked_mul(b)
        .ok_or_else(|| BillingError::AmountOverflow(format!("{} * {}", a, b)))
}

fn add(a: Decimal, b: Decimal) -> BillingResult<Decimal> {
    a.checked_add(b)
        .ok_or_else(|| BillingError::AmountOverflow(format!("{} + {}", a, b)))
}

fn total(details: &[RangeDetail]) -> BillingResult<Decimal> {
    details
        .iter()
        .try_fold(Decimal::ZERO, |acc, d| add(acc, d.total_with_flat_amount))
}

/// Price `quantity` with `model`
pub fn apply(charge_id: ChargeId, model: &ChargeModel, quantity: Quantity) -> BillingResult<PricedAmount> {
    validate(charge_id, model)?;

    let units = quantity.units.max(Decimal::ZERO);
    if units.is_zero() {
        return Ok(PricedAmount::zero());
    }

    let priced = match model {
        ChargeModel::Standard { amount } => {
            PricedAmount::new(mul(units, *amount)?, units, AmountDetails::None)
        }
        ChargeModel::Graduated { ranges } => graduated(ranges, units)?,
        ChargeModel::GraduatedPercentage { ranges } => graduated_percentage(ranges, units)?,
        ChargeModel::Package {
            amount,
            package_size,
            free_units,
        } => package(*amount, *package_size, *free_units, units)?,
        ChargeModel::Percentage {
            rate,
            fixed_amount,
            free_units_per_events,
            free_units_per_total_aggregation,
        } => percentage(
            *rate,
            fixed_amount.unwrap_or(Decimal::ZERO),
            *free_units_per_events,
            *free_units_per_total_aggregation,
            units,
            quantity.events_count,
        )?,
        ChargeModel::Volume { ranges } => volume(ranges, units)?,
    };

    Ok(priced)
}

// =============================================================================
// Validation
// =============================================================================

fn validate(charge_id: ChargeId, model: &ChargeModel) -> BillingResult<()> {
    let invalid = |reason: &str| BillingError::InvalidChargeProperties {
        charge_id,
        model: model.name(),
        reason: reason.to_string(),
    };

    match model {
        ChargeModel::Standard { amount } => {
            if amount.is_sign_negative() {
                return Err(invalid("amount must not be negative"));
            }
        }
        ChargeModel::Graduated { ranges } | ChargeModel::Volume { ranges } => {
            let bounds: Vec<_> = ranges.iter().map(|r| (r.from_value, r.to_value)).collect();
            validate_bounds(&bounds).map_err(|reason| invalid(&reason))?;
            if ranges
                .iter()
                .any(|r| r.per_unit_amount.is_sign_negative() || r.flat_amount.is_sign_negative())
            {
                return Err(invalid("range amounts must not be negative"));
            }
        }
        ChargeModel::GraduatedPercentage { ranges } => {
            let bounds: Vec<_> = ranges.iter().map(|r| (r.from_value, r.to_value)).collect();
            validate_bounds(&bounds).map_err(|reason| invalid(&reason))?;
            if ranges
                .iter()
                .any(|r| r.rate.is_sign_negative() || r.flat_amount.is_sign_negative())
            {
                return Err(invalid("range rates must not be negative"));
            }
        }
        ChargeModel::Package {
            amount,
            package_size,
            free_units,
        } => {
            if *package_size <= Decimal::ZERO {
                return Err(invalid("package_size must be positive"));
            }
            if amount.is_sign_negative() || free_units.is_sign_negative() {
                return Err(invalid("amount and free_units must not be negative"));
            }
        }
        ChargeModel::Percentage {
            rate,
            fixed_amount,
            free_units_per_total_aggregation,
            ..
        } => {
            if rate.is_sign_negative() {
                return Err(invalid("rate must not be negative"));
            }
            if fixed_amount.map(|a| a.is_sign_negative()).unwrap_or(false) {
                return Err(invalid("fixed_amount must not be negative"));
            }
            if free_units_per_total_aggregation
                .map(|a| a.is_sign_negative())
                .unwrap_or(false)
            {
                return Err(invalid("free_units_per_total_aggregation must not be negative"));
            }
        }
    }

    Ok(())
}

/// Ranges must start at zero, be contiguous, and only the last may be open
fn validate_bounds(bounds: &[(Decimal, Option<Decimal>)]) -> Result<(), String> {
    let Some((first_from, _)) = bounds.first() else {
        return Err("ranges must not be empty".to_string());
    };
    if !first_from.is_zero() {
        return Err("first range must start at 0".to_string());
    }

    for (i, (from, to)) in bounds.iter().enumerate() {
        let is_last = i + 1 == bounds.len();
        match to {
            Some(to) if to <= from => {
                return Err(format!("range {} ends before it starts", i));
            }
            Some(to) => {
                if let Some((next_from, _)) = bounds.get(i + 1) {
                    if next_from != to {
                        return Err(format!("range {} is not contiguous with the next one", i));
                    }
                }
            }
            None if !is_last => {
                return Err(format!("only the last range may be open-ended, range {} is not", i));
            }
            None => {}
        }
    }

    Ok(())
}

// =============================================================================
// Models
// =============================================================================

/// Units of `units` that fall inside `[from, to)`
fn units_in_range(units: Decimal, from: Decimal, to: Option<Decimal>) -> Decimal {
    let upper = match to {
        Some(to) => units.min(to),
        None => units,
    };
    (upper - from).max(Decimal::ZERO)
}

fn graduated(ranges: &[PriceRange], units: Decimal) -> BillingResult<PricedAmount> {
    let details = ranges
        .iter()
        .filter(|r| units > r.from_value)
        .map(|r| {
            let tier_units = units_in_range(units, r.from_value, r.to_value);
            let per_unit_total_amount = mul(tier_units, r.per_unit_amount)?;
            Ok(RangeDetail {
                from_value: r.from_value,
                to_value: r.to_value,
                units: tier_units,
                per_unit_amount: r.per_unit_amount,
                per_unit_total_amount,
                flat_unit_amount: r.flat_amount,
                total_with_flat_amount: add(per_unit_total_amount, r.flat_amount)?,
            })
        })
        .collect::<BillingResult<Vec<RangeDetail>>>()?;

    let amount = total(&details)?;
    Ok(PricedAmount::new(amount, units, AmountDetails::Ranges { ranges: details }))
}

fn graduated_percentage(ranges: &[PercentageRange], units: Decimal) -> BillingResult<PricedAmount> {
    let details = ranges
        .iter()
        .filter(|r| units > r.from_value)
        .map(|r| {
            let tier_units = units_in_range(units, r.from_value, r.to_value);
            let per_unit_total_amount = mul(tier_units, r.rate)? / HUNDRED;
            Ok(RangeDetail {
                from_value: r.from_value,
                to_value: r.to_value,
                units: tier_units,
                per_unit_amount: r.rate,
                per_unit_total_amount,
                flat_unit_amount: r.flat_amount,
                total_with_flat_amount: add(per_unit_total_amount, r.flat_amount)?,
            })
        })
        .collect::<BillingResult<Vec<RangeDetail>>>()?;

    let amount = total(&details)?;
    Ok(PricedAmount::new(amount, units, AmountDetails::Ranges { ranges: details }))
}

fn package(
    amount: Decimal,
    package_size: Decimal,
    free_units: Decimal,
    units: Decimal,
) -> BillingResult<PricedAmount> {
    let paid_units = (units - free_units).max(Decimal::ZERO);
    let packages = (paid_units / package_size).ceil();

    Ok(PricedAmount::new(
        mul(packages, amount)?,
        units,
        AmountDetails::Package {
            free_units: units.min(free_units),
            paid_units,
            per_package_size: package_size,
            per_package_unit_amount: amount,
        },
    ))
}

/// Free units come from the free aggregated total and/or the first free
/// events. Without per-event values the free events are valued at the
/// average event; with both settings the smaller allowance applies.
fn percentage(
    rate: Decimal,
    fixed_amount: Decimal,
    free_units_per_events: Option<u64>,
    free_units_per_total_aggregation: Option<Decimal>,
    units: Decimal,
    events_count: u64,
) -> BillingResult<PricedAmount> {
    let free_events = free_units_per_events
        .map(|n| n.min(events_count))
        .unwrap_or(0);
    let paid_events = events_count - free_events;

    let free_from_events = free_units_per_events.map(|_| {
        if events_count == 0 {
            Decimal::ZERO
        } else {
            units * Decimal::from(free_events) / Decimal::from(events_count)
        }
    });
    let free_units = match (free_from_events, free_units_per_total_aggregation) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => Decimal::ZERO,
    }
    .min(units);
    let paid_units = units - free_units;

    let per_unit_total_amount = mul(paid_units, rate)? / HUNDRED;
    let fixed_fee_total_amount = mul(fixed_amount, Decimal::from(paid_events))?;

    Ok(PricedAmount::new(
        add(per_unit_total_amount, fixed_fee_total_amount)?,
        units,
        AmountDetails::Percentage {
            units,
            free_units,
            paid_units,
            rate,
            per_unit_total_amount,
            free_events,
            paid_events,
            fixed_fee_unit_amount: fixed_amount,
            fixed_fee_total_amount,
        },
    ))
}

fn volume(ranges: &[PriceRange], units: Decimal) -> BillingResult<PricedAmount> {
    let tier = ranges
        .iter()
        .find(|r| r.to_value.map(|to| units <= to).unwrap_or(true))
        .or_else(|| ranges.last());

    let Some(tier) = tier else {
        return Ok(PricedAmount::zero());
    };

    let per_unit_total_amount = mul(units, tier.per_unit_amount)?;
    Ok(PricedAmount::new(
        add(per_unit_total_amount, tier.flat_amount)?,
        units,
        AmountDetails::Volume {
            flat_unit_amount: tier.flat_amount,
            per_unit_amount: tier.per_unit_amount,
            per_unit_total_amount,
        },
    ))
}
