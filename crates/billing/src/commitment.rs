//! Minimum commitment true-up
//!
//! A plan's minimum commitment is the least a subscription pays over one
//! billing period. When the qualifying fees of the period stay below it, a
//! commitment fee bills the difference. Which fees qualify depends on whether
//! the plan is billed in advance or in arrears.

use std::collections::BTreeMap;

use meterbill_shared::{
    AmountDetails, Fee, FeeId, FeeProperties, FeeType, InvoiceId, InvoiceSubscription,
    MinimumCommitment, Plan, Subscription,
};
use rust_decimal::Decimal;

use crate::boundaries::{resolve, resolve_final, PeriodBoundaries};
use crate::dates::DatesService;
use crate::error::BillingResult;
use crate::money::{round_cents, shortfall, sum_cents};
use crate::store::{CatalogStore, FeeQuery, FeeStore};

/// How a fee relates to its charge, for qualification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChargeFeeKind {
    /// Charge billed at period end
    Arrears,
    /// Pay-in-advance charge, fee billed as events arrived
    InAdvance,
    /// Pay-in-advance recurring charge, fee billed at period end
    RecurringAdvanceInArrears,
    Other,
}

/// Computes the commitment true-up for one invoice subscription
pub struct CommitmentCalculator<'a> {
    subscription: &'a Subscription,
    plan: &'a Plan,
    commitment: &'a MinimumCommitment,
    invoice_subscription: &'a InvoiceSubscription,
    catalog: &'a dyn CatalogStore,
    fees: &'a dyn FeeStore,
    timezone: chrono_tz::Tz,
}

impl<'a> CommitmentCalculator<'a> {
    pub fn new(
        subscription: &'a Subscription,
        plan: &'a Plan,
        commitment: &'a MinimumCommitment,
        invoice_subscription: &'a InvoiceSubscription,
        catalog: &'a dyn CatalogStore,
        fees: &'a dyn FeeStore,
        timezone: chrono_tz::Tz,
    ) -> Self {
        Self {
            subscription,
            plan,
            commitment,
            invoice_subscription,
            catalog,
            fees,
            timezone,
        }
    }

    /// Commitment fee for the period, `None` when the commitment is met
    pub fn true_up(&self) -> BillingResult<Option<Fee>> {
        let (boundaries, qualifying) = if self.plan.pay_in_advance {
            match self.in_advance()? {
                Some(found) => found,
                None => {
                    tracing::debug!(
                        subscription_id = %self.subscription.id,
                        "No previous invoice, commitment true-up skipped"
                    );
                    return Ok(None);
                }
            }
        } else {
            self.in_arrears()?
        };

        if boundaries.to_datetime <= boundaries.from_datetime {
            return Ok(None);
        }

        let commitment_cents = round_cents(
            Decimal::from(self.commitment.amount_cents) * boundaries.period_coefficient(),
        )?;
        let qualifying_cents = sum_cents(&qualifying)?;
        let amount_cents = shortfall(commitment_cents, qualifying_cents);

        tracing::info!(
            subscription_id = %self.subscription.id,
            minimum_commitment_id = %self.commitment.id,
            commitment_cents = commitment_cents,
            qualifying_cents = qualifying_cents,
            qualifying_fees = qualifying.len(),
            true_up_cents = amount_cents,
            "Computed minimum commitment true-up"
        );

        if amount_cents == 0 {
            return Ok(None);
        }

        Ok(Some(self.commitment_fee(amount_cents, &boundaries)))
    }

    // =========================================================================
    // Advance
    // =========================================================================

    /// The invoice opens a new period: the commitment of the period that just
    /// ended is evaluated
    fn in_advance(&self) -> BillingResult<Option<(PeriodBoundaries, Vec<Fee>)>> {
        let timestamp = self.invoice_subscription.timestamp;
        let history = self.catalog.invoice_subscriptions(self.subscription.id)?;
        let has_previous = history.iter().any(|i| i.timestamp < timestamp);
        if !has_previous {
            return Ok(None);
        }

        let previous = resolve(self.subscription, self.plan, timestamp, false, self.timezone)?;
        let mut qualifying = Vec::new();

        qualifying.extend(self.fees.fees_for(
            &FeeQuery::new(self.subscription.id)
                .fee_type(FeeType::Subscription)
                .within_period(previous.from_datetime, previous.to_datetime),
        )?);

        let period_invoices = invoices_within_charges(&history, &previous);
        qualifying.extend(self.charge_fees(
            FeeQuery::new(self.subscription.id)
                .fee_type(FeeType::Charge)
                .on_invoices(period_invoices),
            ChargeFeeKind::Arrears,
        )?);

        let in_previous_charges = FeeQuery::new(self.subscription.id)
            .fee_type(FeeType::Charge)
            .within_charges_period(previous.charges_from_datetime, previous.charges_to_datetime);
        qualifying.extend(self.charge_fees(in_previous_charges.clone(), ChargeFeeKind::InAdvance)?);
        qualifying.extend(self.charge_fees(
            in_previous_charges,
            ChargeFeeKind::RecurringAdvanceInArrears,
        )?);

        Ok(Some((previous, qualifying)))
    }

    // =========================================================================
    // Arrears
    // =========================================================================

    /// The invoice closes the billed period, or the last period on
    /// termination
    fn in_arrears(&self) -> BillingResult<(PeriodBoundaries, Vec<Fee>)> {
        let timestamp = self.invoice_subscription.timestamp;
        let boundaries = match self.subscription.terminated_at {
            Some(terminated_at) if terminated_at <= timestamp => {
                resolve_final(self.subscription, self.plan, terminated_at, self.timezone)?
            }
            _ => resolve(self.subscription, self.plan, timestamp, false, self.timezone)?,
        };
        let dates = DatesService::new(self.subscription, self.plan, self.timezone);
        let history = self.catalog.invoice_subscriptions(self.subscription.id)?;
        let mut qualifying = Vec::new();

        let period_invoices: Vec<InvoiceId> = history
            .iter()
            .filter(|i| {
                i.from_datetime >= boundaries.from_datetime && i.to_datetime <= boundaries.to_datetime
            })
            .map(|i| i.invoice_id)
            .collect();
        qualifying.extend(self.fees.fees_for(
            &FeeQuery::new(self.subscription.id)
                .fee_type(FeeType::Subscription)
                .on_invoices(period_invoices),
        )?);

        let in_charges = FeeQuery::new(self.subscription.id)
            .fee_type(FeeType::Charge)
            .within_charges_period(boundaries.charges_from_datetime, boundaries.charges_to_datetime);
        qualifying.extend(self.charge_fees(in_charges.clone(), ChargeFeeKind::Arrears)?);
        qualifying.extend(self.charge_fees(in_charges, ChargeFeeKind::InAdvance)?);

        // Recurring pay-in-advance charges billed at period end
        let recurring = if self.plan.is_yearly_with_monthly_charges() {
            let lower = dates
                .charges_period_dates(boundaries.charges_from_datetime)?
                .previous_beginning_of_period;
            FeeQuery::new(self.subscription.id)
                .fee_type(FeeType::Charge)
                .within_charges_period(lower, boundaries.charges_to_datetime)
                .excluding_invoice(self.invoice_subscription.invoice_id)
        } else {
            let lower = dates.period_dates(timestamp)?.previous_beginning_of_period;
            FeeQuery::new(self.subscription.id)
                .fee_type(FeeType::Charge)
                .within_charges_period(lower, boundaries.charges_to_datetime)
        };
        qualifying.extend(self.charge_fees(recurring, ChargeFeeKind::RecurringAdvanceInArrears)?);

        Ok((boundaries, qualifying))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn charge_fees(&self, query: FeeQuery, kind: ChargeFeeKind) -> BillingResult<Vec<Fee>> {
        Ok(self
            .fees
            .fees_for(&query)?
            .into_iter()
            .filter(|fee| self.classify(fee) == kind)
            .collect())
    }

    fn classify(&self, fee: &Fee) -> ChargeFeeKind {
        let Some(charge) = fee.charge_id.and_then(|id| self.plan.charge(&id)) else {
            return ChargeFeeKind::Other;
        };

        match (charge.pay_in_advance, fee.pay_in_advance) {
            (false, _) => ChargeFeeKind::Arrears,
            (true, true) => ChargeFeeKind::InAdvance,
            (true, false) if charge.is_recurring() => ChargeFeeKind::RecurringAdvanceInArrears,
            (true, false) => ChargeFeeKind::Other,
        }
    }

    fn commitment_fee(&self, amount_cents: i64, boundaries: &PeriodBoundaries) -> Fee {
        let subscription_id = self.subscription.id.to_string();
        let commitment_id = self.commitment.id.to_string();
        let period_start = boundaries.from_datetime.to_rfc3339();
        let precise_amount_cents = Decimal::from(amount_cents);
        let multiplier = Decimal::from(self.plan.currency.subunit_multiplier());

        Fee {
            id: FeeId::derive(&[
                subscription_id.as_str(),
                "commitment",
                commitment_id.as_str(),
                period_start.as_str(),
            ]),
            invoice_id: Some(self.invoice_subscription.invoice_id),
            subscription_id: self.subscription.id,
            fee_type: FeeType::Commitment,
            charge_id: None,
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
            properties: FeeProperties {
                timestamp: self.invoice_subscription.timestamp,
                ..boundaries.fee_properties()
            },
            true_up_parent_fee_id: None,
        }
    }
}

/// Invoices whose recorded charge period lies inside `boundaries`' charge period
fn invoices_within_charges(
    history: &[InvoiceSubscription],
    boundaries: &PeriodBoundaries,
) -> Vec<InvoiceId> {
    history
        .iter()
        .filter(|i| {
            i.charges_from_datetime >= boundaries.charges_from_datetime
                && i.charges_to_datetime <= boundaries.charges_to_datetime
        })
        .map(|i| i.invoice_id)
        .collect()
}
