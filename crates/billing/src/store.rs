//! Read-only collaborators the engine pulls its inputs from
//!
//! Persistence lives outside this crate. The engine only sees these traits;
//! [`MemoryStore`] implements all of them over plain vectors and doubles as
//! the snapshot format loaded by the worker.

use chrono::{DateTime, Utc};
use meterbill_shared::{
    ChargeId, Fee, FeeType, FixedChargeEvent, InvoiceId, InvoiceSubscription,
    InvoiceSubscriptionId, MinimumCommitment, MinimumCommitmentId, Plan, PlanId, Subscription,
    SubscriptionId, SubscriptionStatus, UsageEvent,
};
use serde::{Deserialize, Serialize};

use crate::error::BillingResult;

/// Source of fixed-charge and usage events
pub trait EventStore: Send + Sync {
    /// Events of a fixed charge with `timestamp` in `[from, to]`, plus the
    /// latest one before `from`, ordered by `ingested_at`
    fn fixed_charge_events(
        &self,
        subscription_id: SubscriptionId,
        charge_id: ChargeId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BillingResult<Vec<FixedChargeEvent>>;

    /// Usage events of a billable metric with `timestamp` in `[from, to)`
    fn usage_events(
        &self,
        subscription_id: SubscriptionId,
        code: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BillingResult<Vec<UsageEvent>>;
}

/// Source of previously computed fees
pub trait FeeStore: Send + Sync {
    fn fees_for(&self, query: &FeeQuery) -> BillingResult<Vec<Fee>>;
}

/// Source of subscriptions, plans and invoice records
pub trait CatalogStore: Send + Sync {
    fn subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>>;

    fn plan(&self, id: PlanId) -> BillingResult<Option<Plan>>;

    fn minimum_commitment(&self, id: MinimumCommitmentId) -> BillingResult<Option<MinimumCommitment>>;

    fn invoice_subscription(
        &self,
        id: InvoiceSubscriptionId,
    ) -> BillingResult<Option<InvoiceSubscription>>;

    /// All invoice subscriptions of a subscription, oldest first
    fn invoice_subscriptions(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Vec<InvoiceSubscription>>;

    /// Subscriptions that should be billed
    fn billable_subscriptions(&self) -> BillingResult<Vec<Subscription>>;
}

// =============================================================================
// Fee Query
// =============================================================================

/// Fee selection on the period snapshot stored with each fee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeQuery {
    pub subscription_id: SubscriptionId,
    pub fee_type: Option<FeeType>,
    pub pay_in_advance: Option<bool>,
    pub from_datetime_gte: Option<DateTime<Utc>>,
    pub to_datetime_lte: Option<DateTime<Utc>>,
    pub charges_from_datetime_gte: Option<DateTime<Utc>>,
    pub charges_to_datetime_lte: Option<DateTime<Utc>>,
    pub invoice_ids: Option<Vec<InvoiceId>>,
    pub exclude_invoice_id: Option<InvoiceId>,
}

impl FeeQuery {
    pub fn new(subscription_id: SubscriptionId) -> Self {
        Self {
            subscription_id,
            fee_type: None,
            pay_in_advance: None,
            from_datetime_gte: None,
            to_datetime_lte: None,
            charges_from_datetime_gte: None,
            charges_to_datetime_lte: None,
            invoice_ids: None,
            exclude_invoice_id: None,
        }
    }

    pub fn fee_type(mut self, fee_type: FeeType) -> Self {
        self.fee_type = Some(fee_type);
        self
    }

    pub fn pay_in_advance(mut self, pay_in_advance: bool) -> Self {
        self.pay_in_advance = Some(pay_in_advance);
        self
    }

    /// Subscription period fully inside `[from, to]`
    pub fn within_period(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from_datetime_gte = Some(from);
        self.to_datetime_lte = Some(to);
        self
    }

    /// Charge period fully inside `[from, to]`
    pub fn within_charges_period(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.charges_from_datetime_gte = Some(from);
        self.charges_to_datetime_lte = Some(to);
        self
    }

    pub fn on_invoices(mut self, invoice_ids: Vec<InvoiceId>) -> Self {
        self.invoice_ids = Some(invoice_ids);
        self
    }

    pub fn excluding_invoice(mut self, invoice_id: InvoiceId) -> Self {
        self.exclude_invoice_id = Some(invoice_id);
        self
    }

    pub fn matches(&self, fee: &Fee) -> bool {
        let props = &fee.properties;

        fee.subscription_id == self.subscription_id
            && self.fee_type.map_or(true, |t| fee.fee_type == t)
            && self.pay_in_advance.map_or(true, |p| fee.pay_in_advance == p)
            && self.from_datetime_gte.map_or(true, |d| props.from_datetime >= d)
            && self.to_datetime_lte.map_or(true, |d| props.to_datetime <= d)
            && self
                .charges_from_datetime_gte
                .map_or(true, |d| props.charges_from_datetime >= d)
            && self
                .charges_to_datetime_lte
                .map_or(true, |d| props.charges_to_datetime <= d)
            && self.invoice_ids.as_ref().map_or(true, |ids| {
                fee.invoice_id.map_or(false, |id| ids.contains(&id))
            })
            && self
                .exclude_invoice_id
                .map_or(true, |excluded| fee.invoice_id != Some(excluded))
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Store backed by in-memory vectors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStore {
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(default)]
    pub invoice_subscriptions: Vec<InvoiceSubscription>,
    #[serde(default)]
    pub fixed_charge_events: Vec<FixedChargeEvent>,
    #[serde(default)]
    pub usage_events: Vec<UsageEvent>,
    #[serde(default)]
    pub fees: Vec<Fee>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn add_plan(&mut self, plan: Plan) {
        self.plans.push(plan);
    }

    pub fn add_invoice_subscription(&mut self, invoice_subscription: InvoiceSubscription) {
        self.invoice_subscriptions.push(invoice_subscription);
    }

    pub fn add_fixed_charge_event(&mut self, event: FixedChargeEvent) {
        self.fixed_charge_events.push(event);
    }

    pub fn add_usage_event(&mut self, event: UsageEvent) {
        self.usage_events.push(event);
    }

    pub fn add_fees(&mut self, fees: impl IntoIterator<Item = Fee>) {
        self.fees.extend(fees);
    }
}

impl EventStore for MemoryStore {
    fn fixed_charge_events(
        &self,
        subscription_id: SubscriptionId,
        charge_id: ChargeId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BillingResult<Vec<FixedChargeEvent>> {
        let of_charge = || {
            self.fixed_charge_events
                .iter()
                .filter(move |e| e.subscription_id == subscription_id && e.charge_id == charge_id)
        };

        let carry_in = of_charge()
            .filter(|e| e.timestamp < from)
            .max_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then(a.ingested_at.cmp(&b.ingested_at))
            });

        let mut events: Vec<FixedChargeEvent> = carry_in
            .into_iter()
            .chain(of_charge().filter(|e| e.timestamp >= from && e.timestamp <= to))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.ingested_at);
        Ok(events)
    }

    fn usage_events(
        &self,
        subscription_id: SubscriptionId,
        code: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BillingResult<Vec<UsageEvent>> {
        Ok(self
            .usage_events
            .iter()
            .filter(|e| e.subscription_id == subscription_id && e.code == code)
            .filter(|e| e.timestamp >= from && e.timestamp < to)
            .cloned()
            .collect())
    }
}

impl FeeStore for MemoryStore {
    fn fees_for(&self, query: &FeeQuery) -> BillingResult<Vec<Fee>> {
        Ok(self.fees.iter().filter(|f| query.matches(f)).cloned().collect())
    }
}

impl CatalogStore for MemoryStore {
    fn subscription(&self, id: SubscriptionId) -> BillingResult<Option<Subscription>> {
        Ok(self.subscriptions.iter().find(|s| s.id == id).cloned())
    }

    fn plan(&self, id: PlanId) -> BillingResult<Option<Plan>> {
        Ok(self.plans.iter().find(|p| p.id == id).cloned())
    }

    fn minimum_commitment(&self, id: MinimumCommitmentId) -> BillingResult<Option<MinimumCommitment>> {
        Ok(self
            .plans
            .iter()
            .filter_map(|p| p.minimum_commitment.as_ref())
            .find(|c| c.id == id)
            .cloned())
    }

    fn invoice_subscription(
        &self,
        id: InvoiceSubscriptionId,
    ) -> BillingResult<Option<InvoiceSubscription>> {
        Ok(self.invoice_subscriptions.iter().find(|i| i.id == id).cloned())
    }

    fn invoice_subscriptions(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Vec<InvoiceSubscription>> {
        let mut found: Vec<InvoiceSubscription> = self
            .invoice_subscriptions
            .iter()
            .filter(|i| i.subscription_id == subscription_id)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.timestamp);
        Ok(found)
    }

    fn billable_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| matches!(s.status, SubscriptionStatus::Active | SubscriptionStatus::Terminated))
            .cloned()
            .collect())
    }
}
