//! Common types used across meterbill

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::currency::Currency;
use crate::error::DomainError;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_wrapper!(
    /// Subscription ID wrapper
    SubscriptionId
);
id_wrapper!(
    /// Plan ID wrapper
    PlanId
);
id_wrapper!(
    /// Charge ID wrapper
    ChargeId
);
id_wrapper!(
    /// Charge filter ID wrapper
    ChargeFilterId
);
id_wrapper!(
    /// Billable metric ID wrapper
    BillableMetricId
);
id_wrapper!(
    /// Invoice ID wrapper
    InvoiceId
);
id_wrapper!(
    /// Invoice subscription ID wrapper
    InvoiceSubscriptionId
);
id_wrapper!(
    /// Minimum commitment ID wrapper
    MinimumCommitmentId
);
id_wrapper!(
    /// Fee ID wrapper
    FeeId
);

/// Namespace for deterministic fee identifiers
const FEE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6d65_7465_7262_696c_6c2d_6665_6573_0001);

impl FeeId {
    /// Derive a stable fee ID from the parts that identify a fee
    /// (subscription, charge, filter, grouping value, period).
    /// Recomputing the same fee yields the same ID.
    pub fn derive(parts: &[&str]) -> Self {
        let name = parts.join("|");
        Self(Uuid::new_v5(&FEE_ID_NAMESPACE, name.as_bytes()))
    }
}

// =============================================================================
// Timezones
// =============================================================================

/// Parse an IANA timezone name (e.g. "Europe/Paris")
pub fn parse_timezone(name: &str) -> Result<Tz, DomainError> {
    name.parse::<Tz>()
        .map_err(|_| DomainError::UnknownTimezone(name.to_string()))
}

// =============================================================================
// Enums
// =============================================================================

/// Billing interval of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanInterval {
    Weekly,
    Monthly,
    Quarterly,
    Semiannual,
    Yearly,
}

impl PlanInterval {
    /// Length of the interval in months, `None` for weekly plans
    pub fn months(&self) -> Option<u32> {
        match self {
            Self::Weekly => None,
            Self::Monthly => Some(1),
            Self::Quarterly => Some(3),
            Self::Semiannual => Some(6),
            Self::Yearly => Some(12),
        }
    }
}

impl std::fmt::Display for PlanInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
            Self::Quarterly => write!(f, "quarterly"),
            Self::Semiannual => write!(f, "semiannual"),
            Self::Yearly => write!(f, "yearly"),
        }
    }
}

/// How billing periods are aligned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingTime {
    /// Periods start on calendar boundaries (1st of month, Monday, Jan 1st...)
    Calendar,
    /// Periods start on the subscription anniversary
    Anniversary,
}

impl Default for BillingTime {
    fn default() -> Self {
        Self::Calendar
    }
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Terminated,
    Canceled,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// Kind of fee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeType {
    Subscription,
    Charge,
    Commitment,
}

/// How a billable metric turns usage events into a quantity.
/// Field-based aggregations carry the event property they read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregationType {
    Count,
    Sum { field_name: String },
    Max { field_name: String },
    UniqueCount { field_name: String },
    Latest { field_name: String },
    WeightedSum { field_name: String },
    /// Script-defined aggregation, evaluated outside this engine
    Custom,
}

impl AggregationType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Count => "count_agg",
            Self::Sum { .. } => "sum_agg",
            Self::Max { .. } => "max_agg",
            Self::UniqueCount { .. } => "unique_count_agg",
            Self::Latest { .. } => "latest_agg",
            Self::WeightedSum { .. } => "weighted_sum_agg",
            Self::Custom => "custom_agg",
        }
    }
}

// =============================================================================
// Pricing Models
// =============================================================================

/// One tier of a graduated or volume price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    pub from_value: Decimal,
    /// `None` for the open-ended last tier
    pub to_value: Option<Decimal>,
    pub per_unit_amount: Decimal,
    #[serde(default)]
    pub flat_amount: Decimal,
}

/// One tier of a graduated percentage price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentageRange {
    pub from_value: Decimal,
    pub to_value: Option<Decimal>,
    /// Percentage applied to the units in this tier (2.5 = 2.5%)
    pub rate: Decimal,
    #[serde(default)]
    pub flat_amount: Decimal,
}

/// Pricing model of a charge. Amounts are in major currency units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ChargeModel {
    /// Flat price per unit
    Standard { amount: Decimal },
    /// Each tier prices the units that fall inside it
    Graduated { ranges: Vec<PriceRange> },
    /// Each tier applies its rate to the units that fall inside it
    GraduatedPercentage { ranges: Vec<PercentageRange> },
    /// Units are billed by started package after the free units
    Package {
        amount: Decimal,
        package_size: Decimal,
        #[serde(default)]
        free_units: Decimal,
    },
    /// Percentage of the aggregated value plus an optional fixed amount per event
    Percentage {
        rate: Decimal,
        #[serde(default)]
        fixed_amount: Option<Decimal>,
        #[serde(default)]
        free_units_per_events: Option<u64>,
        #[serde(default)]
        free_units_per_total_aggregation: Option<Decimal>,
    },
    /// The tier reached by the total prices every unit
    Volume { ranges: Vec<PriceRange> },
}

impl ChargeModel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Standard { .. } => "standard",
            Self::Graduated { .. } => "graduated",
            Self::GraduatedPercentage { .. } => "graduated_percentage",
            Self::Package { .. } => "package",
            Self::Percentage { .. } => "percentage",
            Self::Volume { .. } => "volume",
        }
    }

    pub fn is_standard(&self) -> bool {
        matches!(self, Self::Standard { .. })
    }
}

/// Breakdown of how a pricing model reached its amount, kept on the fee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AmountDetails {
    None,
    Ranges {
        ranges: Vec<RangeDetail>,
    },
    Volume {
        flat_unit_amount: Decimal,
        per_unit_amount: Decimal,
        per_unit_total_amount: Decimal,
    },
    Package {
        free_units: Decimal,
        paid_units: Decimal,
        per_package_size: Decimal,
        per_package_unit_amount: Decimal,
    },
    Percentage {
        units: Decimal,
        free_units: Decimal,
        paid_units: Decimal,
        rate: Decimal,
        per_unit_total_amount: Decimal,
        free_events: u64,
        paid_events: u64,
        fixed_fee_unit_amount: Decimal,
        fixed_fee_total_amount: Decimal,
    },
}

impl Default for AmountDetails {
    fn default() -> Self {
        Self::None
    }
}

/// Per-tier detail for graduated models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeDetail {
    pub from_value: Decimal,
    pub to_value: Option<Decimal>,
    pub units: Decimal,
    /// Per-unit price, or the rate for percentage tiers
    pub per_unit_amount: Decimal,
    pub per_unit_total_amount: Decimal,
    pub flat_unit_amount: Decimal,
    pub total_with_flat_amount: Decimal,
}

// =============================================================================
// Catalog
// =============================================================================

/// Billable metric backing a metered charge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillableMetric {
    pub id: BillableMetricId,
    pub code: String,
    pub aggregation_type: AggregationType,
    /// Recurring metrics keep their usage from one period to the next
    #[serde(default)]
    pub recurring: bool,
}

/// Whether a charge is driven by usage events or fixed-charge events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChargeKind {
    Metered { billable_metric: BillableMetric },
    Fixed,
}

/// Filter narrowing a charge to events whose properties match `values`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeFilter {
    pub id: ChargeFilterId,
    /// Property key -> accepted values
    pub values: BTreeMap<String, Vec<String>>,
    /// Pricing override for the filtered usage, falls back to the charge model
    #[serde(default)]
    pub charge_model: Option<ChargeModel>,
    #[serde(default)]
    pub invoice_display_name: Option<String>,
}

impl ChargeFilter {
    /// Filter keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

/// A priced component of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub id: ChargeId,
    pub kind: ChargeKind,
    pub charge_model: ChargeModel,
    #[serde(default)]
    pub pay_in_advance: bool,
    #[serde(default)]
    pub prorated: bool,
    #[serde(default = "default_true")]
    pub invoiceable: bool,
    /// Minimum amount billed for this charge per full period, in cents
    #[serde(default)]
    pub min_amount_cents: Option<i64>,
    #[serde(default)]
    pub filters: Vec<ChargeFilter>,
    /// Event properties used to split the charge into one fee per value
    #[serde(default)]
    pub grouping_keys: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Charge {
    pub fn billable_metric(&self) -> Option<&BillableMetric> {
        match &self.kind {
            ChargeKind::Metered { billable_metric } => Some(billable_metric),
            ChargeKind::Fixed => None,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.kind, ChargeKind::Fixed)
    }

    /// Fixed charges always carry their state into the next period
    pub fn is_recurring(&self) -> bool {
        match &self.kind {
            ChargeKind::Metered { billable_metric } => billable_metric.recurring,
            ChargeKind::Fixed => true,
        }
    }
}

/// Plan-level minimum spend per billing period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimumCommitment {
    pub id: MinimumCommitmentId,
    pub plan_id: PlanId,
    pub amount_cents: i64,
    #[serde(default)]
    pub invoice_display_name: Option<String>,
}

/// Subscription plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub code: String,
    pub interval: PlanInterval,
    #[serde(default)]
    pub pay_in_advance: bool,
    /// Only meaningful for yearly plans: charges are invoiced every month
    #[serde(default)]
    pub bill_charges_monthly: bool,
    pub amount_cents: i64,
    pub currency: Currency,
    #[serde(default)]
    pub charges: Vec<Charge>,
    #[serde(default)]
    pub minimum_commitment: Option<MinimumCommitment>,
}

impl Plan {
    pub fn charge(&self, charge_id: &ChargeId) -> Option<&Charge> {
        self.charges.iter().find(|c| &c.id == charge_id)
    }

    /// Yearly plan whose charges are billed on a monthly cadence
    pub fn is_yearly_with_monthly_charges(&self) -> bool {
        self.interval == PlanInterval::Yearly && self.bill_charges_monthly
    }
}

/// Customer subscription to a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub external_id: String,
    pub plan_id: PlanId,
    #[serde(default)]
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub billing_time: BillingTime,
    pub started_at: DateTime<Utc>,
    /// Anchor for anniversary billing
    pub subscription_at: DateTime<Utc>,
    #[serde(default)]
    pub terminated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub customer_timezone: Option<Tz>,
    #[serde(default)]
    pub organization_timezone: Option<Tz>,
}

impl Subscription {
    /// Customer timezone, then organization timezone, then `default`
    pub fn timezone(&self, default: Tz) -> Tz {
        self.customer_timezone
            .or(self.organization_timezone)
            .unwrap_or(default)
    }
}

/// Link between an invoice and a subscription for one billing run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSubscription {
    pub id: InvoiceSubscriptionId,
    pub invoice_id: InvoiceId,
    pub subscription_id: SubscriptionId,
    /// Billing instant the invoice was generated for
    pub timestamp: DateTime<Utc>,
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
    pub charges_from_datetime: DateTime<Utc>,
    pub charges_to_datetime: DateTime<Utc>,
}

// =============================================================================
// Events
// =============================================================================

/// State change of a fixed charge: the charge holds `units` from `timestamp` on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedChargeEvent {
    pub subscription_id: SubscriptionId,
    pub charge_id: ChargeId,
    pub timestamp: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub units: Decimal,
}

/// Metered usage event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub transaction_id: String,
    pub subscription_id: SubscriptionId,
    pub code: String,
    pub timestamp: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl UsageEvent {
    /// Property rendered as a string, numbers and booleans included
    pub fn property_str(&self, key: &str) -> Option<String> {
        match self.properties.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Property parsed as a decimal; strings holding numbers are accepted
    pub fn property_decimal(&self, key: &str) -> Option<Decimal> {
        match self.properties.get(key)? {
            serde_json::Value::Number(n) => n.to_string().parse().ok(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

// =============================================================================
// Fees
// =============================================================================

/// Period boundaries a fee was computed for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeProperties {
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
    pub charges_from_datetime: DateTime<Utc>,
    pub charges_to_datetime: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub charges_duration_in_days: i64,
}

/// Computed billing line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fee {
    pub id: FeeId,
    #[serde(default)]
    pub invoice_id: Option<InvoiceId>,
    pub subscription_id: SubscriptionId,
    pub fee_type: FeeType,
    #[serde(default)]
    pub charge_id: Option<ChargeId>,
    #[serde(default)]
    pub charge_filter_id: Option<ChargeFilterId>,
    /// Fee was billed before the period it covers
    #[serde(default)]
    pub pay_in_advance: bool,
    pub units: Decimal,
    #[serde(default)]
    pub events_count: u64,
    pub amount_cents: i64,
    pub precise_amount_cents: Decimal,
    pub unit_amount_cents: i64,
    pub precise_unit_amount: Decimal,
    pub currency: Currency,
    #[serde(default)]
    pub grouped_by: BTreeMap<String, String>,
    #[serde(default)]
    pub amount_details: AmountDetails,
    pub properties: FeeProperties,
    #[serde(default)]
    pub true_up_parent_fee_id: Option<FeeId>,
}

impl Fee {
    pub fn is_true_up(&self) -> bool {
        self.true_up_parent_fee_id.is_some()
    }
}
