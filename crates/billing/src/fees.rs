//! Fee building
//!
//! Turns the quantities of a plan's charges over one billing period into
//! [`Fee`] records, then applies each charge's own minimum (the per-charge
//! true-up). The plan-level minimum commitment lives in [`crate::commitment`].

use std::collections::BTreeMap;

use meterbill_shared::{
    AmountDetails, Charge, ChargeFilter, ChargeKind, Fee, FeeId, FeeType, Plan, Subscription,
};
use rust_decimal::Decimal;

use crate::aggregation::{aggregate, GroupKey, Quantity};
use crate::boundaries::PeriodBoundaries;
use crate::charge_models;
use crate::config::EngineConfig;
use crate::error::BillingResult;
use crate::filters::{filter_keys, filter_quantities, line_charge_model};
use crate::money::{round_cents, shortfall, sum_cents, to_cents};
use crate::proration::{preview_units, prorate, units_at_end};
use crate::store::EventStore;

/// One priced line of a charge before it becomes a fee
#[derive(Debug, Clone)]
struct ChargeLine<'a> {
    filter: Option<&'a ChargeFilter>,
    grouped_by: GroupKey,
    quantity: Quantity,
}

/// Builds the fees of one subscription for one billing period
pub struct FeeBuilder<'a> {
    subscription: &'a Subscription,
    plan: &'a Plan,
    boundaries: &'a PeriodBoundaries,
    events: &'a dyn EventStore,
    config: &'a EngineConfig,
    /// Days elapsed in the charge period when previewing current usage
    accrued_days: Option<i64>,
}

impl<'a> FeeBuilder<'a> {
    pub fn new(
        subscription: &'a Subscription,
        plan: &'a Plan,
        boundaries: &'a PeriodBoundaries,
        events: &'a dyn EventStore,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            subscription,
            plan,
            boundaries,
            events,
            config,
            accrued_days: None,
        }
    }

    /// Price prorated fixed charges for the days elapsed so far instead of
    /// the whole charge period
    pub fn with_accrued_days(mut self, elapsed_days: i64) -> Self {
        self.accrued_days = Some(elapsed_days);
        self
    }

    /// Fees of every charge of the plan, true-ups included
    pub fn build_fees(&self) -> BillingResult<Vec<Fee>> {
        let mut fees = Vec::new();
        for charge in &self.plan.charges {
            fees.extend(self.charge_fees(charge)?);
        }
        Ok(fees)
    }

    /// Fees of one charge, followed by its true-up fee if the charge
    /// minimum was not reached
    pub fn charge_fees(&self, charge: &Charge) -> BillingResult<Vec<Fee>> {
        if !charge.invoiceable {
            tracing::debug!(charge_id = %charge.id, "Skipping non-invoiceable charge");
            return Ok(Vec::new());
        }
        if charge.pay_in_advance && !charge.is_recurring() {
            tracing::debug!(
                charge_id = %charge.id,
                "Skipping pay-in-advance charge, billed as events arrive"
            );
            return Ok(Vec::new());
        }

        if self.boundaries.is_empty() {
            let lines = self.zero_lines(charge);
            let fees = lines
                .into_iter()
                .map(|line| self.build_fee(charge, line))
                .collect::<BillingResult<Vec<Fee>>>()?;
            return Ok(self.keep_emitted(fees));
        }

        let lines = match &charge.kind {
            ChargeKind::Fixed => self.fixed_charge_lines(charge)?,
            ChargeKind::Metered { .. } => self.metered_lines(charge)?,
        };

        let fees = lines
            .into_iter()
            .map(|line| self.build_fee(charge, line))
            .collect::<BillingResult<Vec<Fee>>>()?;
        let true_up = self.charge_true_up(charge, &fees)?;

        let mut fees = self.keep_emitted(fees);
        fees.extend(true_up);
        Ok(fees)
    }

    /// Minimum of the charge prorated to the elapsed part of the charge
    /// period, billed as the difference with what the charge's fees reached
    pub fn charge_true_up(&self, charge: &Charge, fees: &[Fee]) -> BillingResult<Option<Fee>> {
        let Some(min_amount_cents) = charge.min_amount_cents else {
            return Ok(None);
        };
        let Some(parent) = fees.first() else {
            return Ok(None);
        };
        if self.boundaries.is_empty() {
            return Ok(None);
        }

        let prorated_min =
            round_cents(Decimal::from(min_amount_cents) * self.boundaries.charges_coefficient())?;
        let billed = sum_cents(fees)?;
        let amount_cents = shortfall(prorated_min, billed);
        if amount_cents == 0 {
            return Ok(None);
        }

        tracing::info!(
            subscription_id = %self.subscription.id,
            charge_id = %charge.id,
            min_amount_cents = min_amount_cents,
            prorated_min_cents = prorated_min,
            billed_cents = billed,
            true_up_cents = amount_cents,
            "Charge minimum not reached, adding true-up fee"
        );

        let precise_amount_cents = Decimal::from(amount_cents);
        let multiplier = Decimal::from(self.plan.currency.subunit_multiplier());
        Ok(Some(Fee {
            id: FeeId::derive(&[parent.id.to_string().as_str(), "true_up"]),
            invoice_id: None,
            subscription_id: self.subscription.id,
            fee_type: FeeType::Charge,
            charge_id: Some(charge.id),
            charge_filter_id: None,
            pay_in_advance: false,
            units: Decimal::ONE,
            events_count: 0,
            amount_cents,
            precise_amount_cents,
            unit_amount_cents: amount_cents,
            precise_unit_amount: precise_amount_cents / multiplier,
            currency: self.plan.currency,
            grouped_by: BTreeMap::new(),
            amount_details: AmountDetails::None,
            properties: self.boundaries.fee_properties(),
            true_up_parent_fee_id: Some(parent.id),
        }))
    }

    /// Plan fee for the subscription period, prorated to the elapsed part
    pub fn subscription_fee(&self) -> BillingResult<Fee> {
        let coefficient = if self.boundaries.to_datetime <= self.boundaries.from_datetime {
            Decimal::ZERO
        } else {
            self.boundaries.period_coefficient()
        };
        let precise_amount_cents = Decimal::from(self.plan.amount_cents) * coefficient;
        let amount_cents = round_cents(precise_amount_cents)?;
        let multiplier = Decimal::from(self.plan.currency.subunit_multiplier());
        let subscription_id = self.subscription.id.to_string();
        let period_start = self.boundaries.from_datetime.to_rfc3339();

        Ok(Fee {
            id: FeeId::derive(&[subscription_id.as_str(), "subscription", period_start.as_str()]),
            invoice_id: None,
            subscription_id: self.subscription.id,
            fee_type: FeeType::Subscription,
            charge_id: None,
            charge_filter_id: None,
            pay_in_advance: self.plan.pay_in_advance,
            units: Decimal::ONE,
            events_count: 0,
            amount_cents,
            precise_amount_cents,
            unit_amount_cents: amount_cents,
            precise_unit_amount: precise_amount_cents / multiplier,
            currency: self.plan.currency,
            grouped_by: BTreeMap::new(),
            amount_details: AmountDetails::None,
            properties: self.boundaries.fee_properties(),
            true_up_parent_fee_id: None,
        })
    }

    // =========================================================================
    // Quantities
    // =========================================================================

    fn fixed_charge_lines<'c>(&self, charge: &'c Charge) -> BillingResult<Vec<ChargeLine<'c>>> {
        let window = self.boundaries.proration_window();
        let events =
            self.events
                .fixed_charge_events(self.subscription.id, charge.id, window.from, window.to)?;

        let units = match (charge.prorated, self.accrued_days) {
            (true, Some(elapsed_days)) => preview_units(
                prorate(&events, &window),
                elapsed_days,
                window.charges_duration_in_days,
            ),
            (true, None) => prorate(&events, &window),
            (false, _) => units_at_end(&events, &window),
        };

        Ok(vec![ChargeLine {
            filter: None,
            grouped_by: GroupKey::new(),
            quantity: Quantity {
                units,
                events_count: events.len() as u64,
            },
        }])
    }

    fn metered_lines<'c>(&self, charge: &'c Charge) -> BillingResult<Vec<ChargeLine<'c>>> {
        let Some(metric) = charge.billable_metric() else {
            return Ok(Vec::new());
        };

        let window = self.boundaries.aggregation_window();
        let events_from = if metric.recurring {
            self.subscription.started_at.min(window.from)
        } else {
            window.from
        };
        let events =
            self.events
                .usage_events(self.subscription.id, &metric.code, events_from, window.to)?;

        let grouped = charge.filters.is_empty()
            && charge.charge_model.is_standard()
            && !charge.grouping_keys.is_empty();
        let group_by = if grouped {
            charge.grouping_keys.clone()
        } else {
            filter_keys(charge)
        };
        let aggregation = aggregate(metric, &events, &group_by, &window)?;

        if grouped {
            let groups = aggregation.by_keys(&charge.grouping_keys)?;
            if groups.is_empty() {
                return Ok(vec![ChargeLine {
                    filter: None,
                    grouped_by: GroupKey::new(),
                    quantity: Quantity::zero(),
                }]);
            }
            return Ok(groups
                .into_iter()
                .map(|(grouped_by, quantity)| ChargeLine {
                    filter: None,
                    grouped_by,
                    quantity,
                })
                .collect());
        }

        Ok(filter_quantities(charge, &aggregation)?
            .into_iter()
            .map(|line| ChargeLine {
                filter: line.filter,
                grouped_by: GroupKey::new(),
                quantity: line.quantity,
            })
            .collect())
    }

    /// One empty line per filter and the default line
    fn zero_lines<'c>(&self, charge: &'c Charge) -> Vec<ChargeLine<'c>> {
        charge
            .filters
            .iter()
            .map(Some)
            .chain(std::iter::once(None))
            .map(|filter| ChargeLine {
                filter,
                grouped_by: GroupKey::new(),
                quantity: Quantity::zero(),
            })
            .collect()
    }

    fn keep_emitted(&self, fees: Vec<Fee>) -> Vec<Fee> {
        if self.config.emit_zero_fees {
            return fees;
        }
        fees.into_iter()
            .filter(|f| f.amount_cents != 0 || !f.units.is_zero())
            .collect()
    }

    // =========================================================================
    // Pricing
    // =========================================================================

    fn build_fee(&self, charge: &Charge, line: ChargeLine<'_>) -> BillingResult<Fee> {
        let model = line_charge_model(charge, line.filter);
        let priced = charge_models::apply(charge.id, model, line.quantity)?;

        let currency = self.plan.currency;
        let amount = to_cents(priced.amount, currency)?;
        let unit_amount = to_cents(priced.unit_amount, currency)?;

        let charge_filter_id = line.filter.map(|f| f.id);
        let grouping = line
            .grouped_by
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let parts = [
            self.subscription.id.to_string(),
            charge.id.to_string(),
            charge_filter_id.map(|id| id.to_string()).unwrap_or_default(),
            grouping,
            self.boundaries.charges_from_datetime.to_rfc3339(),
            self.boundaries.charges_to_datetime.to_rfc3339(),
        ];
        let id = FeeId::derive(&parts.iter().map(String::as_str).collect::<Vec<_>>());

        tracing::debug!(
            subscription_id = %self.subscription.id,
            charge_id = %charge.id,
            model = model.name(),
            units = %line.quantity.units,
            amount_cents = amount.amount_cents,
            "Built charge fee"
        );

        Ok(Fee {
            id,
            invoice_id: None,
            subscription_id: self.subscription.id,
            fee_type: FeeType::Charge,
            charge_id: Some(charge.id),
            charge_filter_id,
            pay_in_advance: false,
            units: line.quantity.units,
            events_count: line.quantity.events_count,
            amount_cents: amount.amount_cents,
            precise_amount_cents: amount.precise_amount_cents,
            unit_amount_cents: unit_amount.amount_cents,
            precise_unit_amount: priced.unit_amount,
            currency,
            grouped_by: line.grouped_by,
            amount_details: priced.amount_details,
            properties: self.boundaries.fee_properties(),
            true_up_parent_fee_id: None,
        })
    }
}
