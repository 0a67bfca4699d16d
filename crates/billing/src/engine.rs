//! Billing engine
//!
//! Entry point of the crate. Loads the subscription, plan and history it
//! needs from the stores and runs the fee and true-up computations. The
//! engine never reads the clock: every call takes the instant it bills for.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use meterbill_shared::{
    Currency, Fee, InvoiceSubscriptionId, MinimumCommitmentId, Plan, Subscription, SubscriptionId,
};
use serde::{Deserialize, Serialize};

use crate::boundaries::{resolve, resolve_final, PeriodBoundaries};
use crate::commitment::CommitmentCalculator;
use crate::config::EngineConfig;
use crate::dates::inclusive_days;
use crate::error::{BillingError, BillingResult};
use crate::fees::FeeBuilder;
use crate::money::sum_cents;
use crate::store::{CatalogStore, EventStore, FeeStore};

/// Usage accrued so far in the current period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentUsage {
    pub subscription_id: SubscriptionId,
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
    pub charges_from_datetime: DateTime<Utc>,
    pub charges_to_datetime: DateTime<Utc>,
    pub issuing_date: NaiveDate,
    pub currency: Currency,
    pub amount_cents: i64,
    pub fees: Vec<Fee>,
}

/// Billing engine over read-only stores
pub struct BillingEngine {
    catalog: Arc<dyn CatalogStore>,
    events: Arc<dyn EventStore>,
    fees: Arc<dyn FeeStore>,
    config: EngineConfig,
}

impl BillingEngine {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        events: Arc<dyn EventStore>,
        fees: Arc<dyn FeeStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            events,
            fees,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fees of the period billed at `reference_instant`: the plan fee when
    /// it is due and every charge fee, true-ups included
    pub fn compute_fees(
        &self,
        subscription_id: SubscriptionId,
        reference_instant: DateTime<Utc>,
    ) -> BillingResult<Vec<Fee>> {
        let (subscription, plan) = self.load(subscription_id)?;
        let timezone = subscription.timezone(self.config.default_timezone);

        // A terminated subscription bills its last period
        let boundaries = match subscription.terminated_at {
            Some(terminated_at) if terminated_at <= reference_instant => {
                resolve_final(&subscription, &plan, terminated_at, timezone)?
            }
            _ => resolve(&subscription, &plan, reference_instant, false, timezone)?,
        };

        let builder = FeeBuilder::new(
            &subscription,
            &plan,
            &boundaries,
            self.events.as_ref(),
            &self.config,
        );
        let mut fees = Vec::new();

        if let Some(fee) =
            self.subscription_fee(&subscription, &plan, &boundaries, reference_instant)?
        {
            fees.push(fee);
        }
        fees.extend(builder.build_fees()?);

        let total_cents = sum_cents(&fees)?;
        tracing::info!(
            subscription_id = %subscription.id,
            plan_code = %plan.code,
            from = %boundaries.charges_from_datetime,
            to = %boundaries.charges_to_datetime,
            fees = fees.len(),
            total_cents = total_cents,
            "Computed subscription fees"
        );

        Ok(fees)
    }

    /// Commitment true-up fee for the invoice subscription, `None` when the
    /// commitment is met
    pub fn compute_true_up(
        &self,
        minimum_commitment_id: MinimumCommitmentId,
        invoice_subscription_id: InvoiceSubscriptionId,
    ) -> BillingResult<Option<Fee>> {
        let commitment = self
            .catalog
            .minimum_commitment(minimum_commitment_id)?
            .ok_or_else(|| {
                BillingError::NotFound(format!("minimum commitment {}", minimum_commitment_id))
            })?;
        let invoice_subscription = self
            .catalog
            .invoice_subscription(invoice_subscription_id)?
            .ok_or_else(|| {
                BillingError::NotFound(format!("invoice subscription {}", invoice_subscription_id))
            })?;
        let (subscription, plan) = self.load(invoice_subscription.subscription_id)?;

        if plan.id != commitment.plan_id {
            return Err(BillingError::InvalidInput(format!(
                "minimum commitment {} does not belong to plan {}",
                commitment.id, plan.code
            )));
        }

        CommitmentCalculator::new(
            &subscription,
            &plan,
            &commitment,
            &invoice_subscription,
            self.catalog.as_ref(),
            self.fees.as_ref(),
            subscription.timezone(self.config.default_timezone),
        )
        .true_up()
    }

    /// Usage of the period containing `reference_instant`, up to that instant
    pub fn current_usage(
        &self,
        subscription_id: SubscriptionId,
        reference_instant: DateTime<Utc>,
    ) -> BillingResult<CurrentUsage> {
        let (subscription, plan) = self.load(subscription_id)?;
        let timezone = subscription.timezone(self.config.default_timezone);
        let boundaries = resolve(&subscription, &plan, reference_instant, true, timezone)?;

        let elapsed_days = inclusive_days(
            timezone,
            boundaries.charges_from_datetime,
            reference_instant.min(boundaries.charges_to_datetime),
        );
        let fees = FeeBuilder::new(
            &subscription,
            &plan,
            &boundaries,
            self.events.as_ref(),
            &self.config,
        )
        .with_accrued_days(elapsed_days)
        .build_fees()?;
        let amount_cents = sum_cents(&fees)?;

        tracing::debug!(
            subscription_id = %subscription.id,
            elapsed_days = elapsed_days,
            amount_cents = amount_cents,
            "Computed current usage"
        );

        Ok(CurrentUsage {
            subscription_id: subscription.id,
            from_datetime: boundaries.from_datetime,
            to_datetime: boundaries.to_datetime,
            charges_from_datetime: boundaries.charges_from_datetime,
            charges_to_datetime: boundaries.charges_to_datetime,
            issuing_date: boundaries.issuing_date,
            currency: plan.currency,
            amount_cents,
            fees,
        })
    }

    /// Subscriptions the worker should bill
    pub fn billable_subscriptions(&self) -> BillingResult<Vec<SubscriptionId>> {
        Ok(self
            .catalog
            .billable_subscriptions()?
            .into_iter()
            .map(|s| s.id)
            .collect())
    }

    fn load(&self, subscription_id: SubscriptionId) -> BillingResult<(Subscription, Plan)> {
        let subscription = self
            .catalog
            .subscription(subscription_id)?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;
        let plan = self
            .catalog
            .plan(subscription.plan_id)?
            .ok_or_else(|| BillingError::PlanNotFound(subscription.plan_id.to_string()))?;
        Ok((subscription, plan))
    }

    /// Plan fee due at this billing run. Arrears plans bill the period that
    /// just closed; advance plans bill the period that just opened, unless
    /// the subscription is already terminated.
    fn subscription_fee(
        &self,
        subscription: &Subscription,
        plan: &Plan,
        boundaries: &PeriodBoundaries,
        reference_instant: DateTime<Utc>,
    ) -> BillingResult<Option<Fee>> {
        let builder = |b: &PeriodBoundaries| {
            FeeBuilder::new(subscription, plan, b, self.events.as_ref(), &self.config)
                .subscription_fee()
        };

        if !plan.pay_in_advance {
            // Yearly plans with monthly charges close the year on its last month only
            let closes_period = !plan.is_yearly_with_monthly_charges()
                || boundaries.terminated
                || boundaries.charges_to_datetime >= boundaries.to_datetime;
            return if closes_period {
                builder(boundaries).map(Some)
            } else {
                Ok(None)
            };
        }

        if subscription.terminated_at.is_some_and(|t| t <= reference_instant) {
            return Ok(None);
        }
        let timezone = boundaries.timezone;
        let current = resolve(subscription, plan, reference_instant, true, timezone)?;
        let opens_period = !plan.is_yearly_with_monthly_charges()
            || current.charges_from_datetime <= current.from_datetime;
        if opens_period {
            let mut fee = builder(&current)?;
            fee.pay_in_advance = true;
            Ok(Some(fee))
        } else {
            Ok(None)
        }
    }
}
