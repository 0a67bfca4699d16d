//! Usage event aggregation
//!
//! Events are folded into one [`GroupState`] per grouping value. States are
//! plain values with an explicit [`GroupState::merge`], so the quantity of a
//! filter or of the whole charge is the merge of the groups it covers.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use meterbill_shared::{AggregationType, BillableMetric, UsageEvent};
use rust_decimal::Decimal;

use crate::error::{BillingError, BillingResult};

/// Grouping value: property key -> property value
pub type GroupKey = BTreeMap<String, String>;

/// Window usage is aggregated over, `[from, to)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Aggregated quantity handed to a pricing model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Quantity {
    pub units: Decimal,
    pub events_count: u64,
}

impl Quantity {
    pub fn zero() -> Self {
        Self::default()
    }
}

/// Running value of one aggregation type
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Count,
    Sum(Decimal),
    Max(Option<Decimal>),
    Unique(BTreeSet<String>),
    Latest(Option<(DateTime<Utc>, Decimal)>),
    /// Increments of a running total, weighted by how long each total held
    WeightedSum(Vec<(DateTime<Utc>, Decimal)>),
    Unsupported,
}

/// Aggregation state of one group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupState {
    pub events_count: u64,
    pub value: StateValue,
}

impl GroupState {
    /// State with no events for `aggregation`
    pub fn empty(aggregation: &AggregationType) -> Self {
        let value = match aggregation {
            AggregationType::Count => StateValue::Count,
            AggregationType::Sum { .. } => StateValue::Sum(Decimal::ZERO),
            AggregationType::Max { .. } => StateValue::Max(None),
            AggregationType::UniqueCount { .. } => StateValue::Unique(BTreeSet::new()),
            AggregationType::Latest { .. } => StateValue::Latest(None),
            AggregationType::WeightedSum { .. } => StateValue::WeightedSum(Vec::new()),
            AggregationType::Custom => StateValue::Unsupported,
        };
        Self {
            events_count: 0,
            value,
        }
    }

    /// State holding a single event
    pub fn from_event(aggregation: &AggregationType, event: &UsageEvent) -> Self {
        let value = match aggregation {
            AggregationType::Count => StateValue::Count,
            AggregationType::Sum { field_name } => {
                StateValue::Sum(event.property_decimal(field_name).unwrap_or(Decimal::ZERO))
            }
            AggregationType::Max { field_name } => StateValue::Max(event.property_decimal(field_name)),
            AggregationType::UniqueCount { field_name } => {
                StateValue::Unique(event.property_str(field_name).into_iter().collect())
            }
            AggregationType::Latest { field_name } => StateValue::Latest(
                event
                    .property_decimal(field_name)
                    .map(|value| (event.timestamp, value)),
            ),
            AggregationType::WeightedSum { field_name } => StateValue::WeightedSum(
                event
                    .property_decimal(field_name)
                    .map(|value| (event.timestamp, value))
                    .into_iter()
                    .collect(),
            ),
            AggregationType::Custom => StateValue::Unsupported,
        };
        Self {
            events_count: 1,
            value,
        }
    }

    /// Combine two states of the same aggregation type
    pub fn merge(self, other: GroupState) -> BillingResult<GroupState> {
        let value = match (self.value, other.value) {
            (StateValue::Count, StateValue::Count) => StateValue::Count,
            (StateValue::Sum(a), StateValue::Sum(b)) => StateValue::Sum(
                a.checked_add(b)
                    .ok_or_else(|| BillingError::AmountOverflow(format!("{} + {}", a, b)))?,
            ),
            (StateValue::Max(a), StateValue::Max(b)) => StateValue::Max(a.max(b)),
            (StateValue::Unique(mut a), StateValue::Unique(b)) => {
                a.extend(b);
                StateValue::Unique(a)
            }
            (StateValue::Latest(a), StateValue::Latest(b)) => StateValue::Latest(match (a, b) {
                (Some(a), Some(b)) => Some(if b.0 >= a.0 { b } else { a }),
                (a, b) => a.or(b),
            }),
            (StateValue::WeightedSum(mut a), StateValue::WeightedSum(b)) => {
                a.extend(b);
                StateValue::WeightedSum(a)
            }
            (value, _) => value,
        };
        Ok(GroupState {
            events_count: self.events_count.saturating_add(other.events_count),
            value,
        })
    }

    /// Billable quantity of this state over `window`, never negative
    pub fn quantity(&self, window: &AggregationWindow) -> Quantity {
        let units = match &self.value {
            StateValue::Count => Decimal::from(self.events_count),
            StateValue::Sum(total) => *total,
            StateValue::Max(max) => max.unwrap_or(Decimal::ZERO),
            StateValue::Unique(values) => Decimal::from(values.len() as u64),
            StateValue::Latest(latest) => latest.map(|(_, v)| v).unwrap_or(Decimal::ZERO),
            StateValue::WeightedSum(points) => weighted_sum(points, window),
            StateValue::Unsupported => Decimal::ZERO,
        };
        Quantity {
            units: units.max(Decimal::ZERO),
            events_count: self.events_count,
        }
    }
}

/// Time-weighted average of a running total over the window. Increments
/// before the window set the opening total.
fn weighted_sum(points: &[(DateTime<Utc>, Decimal)], window: &AggregationWindow) -> Decimal {
    let period_seconds = (window.to - window.from).num_seconds();
    if period_seconds <= 0 {
        return Decimal::ZERO;
    }

    let mut sorted: Vec<&(DateTime<Utc>, Decimal)> = points.iter().collect();
    sorted.sort_by_key(|(ts, _)| *ts);

    let mut running: Decimal = sorted
        .iter()
        .filter(|(ts, _)| *ts < window.from)
        .map(|(_, v)| *v)
        .sum();
    let mut cursor = window.from;
    let mut weighted = Decimal::ZERO;

    for (ts, delta) in sorted
        .iter()
        .filter(|(ts, _)| *ts >= window.from && *ts < window.to)
    {
        weighted += running * Decimal::from((*ts - cursor).num_seconds());
        running += *delta;
        cursor = *ts;
    }
    weighted += running * Decimal::from((window.to - cursor).num_seconds());

    weighted / Decimal::from(period_seconds)
}

/// Per-group aggregation of a metric's events
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    aggregation_type: AggregationType,
    window: AggregationWindow,
    groups: BTreeMap<GroupKey, GroupState>,
}

impl Aggregation {
    pub fn groups(&self) -> &BTreeMap<GroupKey, GroupState> {
        &self.groups
    }

    pub fn window(&self) -> &AggregationWindow {
        &self.window
    }

    /// Merge of the groups accepted by `predicate`
    pub fn merged<P>(&self, predicate: P) -> BillingResult<GroupState>
    where
        P: Fn(&GroupKey) -> bool,
    {
        self.groups
            .iter()
            .filter(|(key, _)| predicate(key))
            .try_fold(GroupState::empty(&self.aggregation_type), |acc, (_, state)| {
                acc.merge(state.clone())
            })
    }

    /// Quantity of the groups accepted by `predicate`
    pub fn quantity_where<P>(&self, predicate: P) -> BillingResult<Quantity>
    where
        P: Fn(&GroupKey) -> bool,
    {
        Ok(self.merged(predicate)?.quantity(&self.window))
    }

    /// Quantity over all groups
    pub fn total(&self) -> BillingResult<Quantity> {
        self.quantity_where(|_| true)
    }

    /// Quantity of each group restricted to `keys`, merging groups that
    /// share the same values for those keys
    pub fn by_keys(&self, keys: &[String]) -> BillingResult<BTreeMap<GroupKey, Quantity>> {
        let mut projected: BTreeMap<GroupKey, GroupState> = BTreeMap::new();
        for (key, state) in &self.groups {
            let sub_key: GroupKey = key
                .iter()
                .filter(|(k, _)| keys.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let merged = match projected.remove(&sub_key) {
                Some(existing) => existing.merge(state.clone())?,
                None => state.clone(),
            };
            projected.insert(sub_key, merged);
        }

        Ok(projected
            .into_iter()
            .map(|(key, state)| (key, state.quantity(&self.window)))
            .collect())
    }
}

/// Aggregate `events` for `metric`, grouped by the values of `group_by`.
///
/// Events at or after `window.to` are dropped. Events before `window.from`
/// only count for recurring metrics, whose usage carries over from the
/// start of the subscription.
pub fn aggregate(
    metric: &BillableMetric,
    events: &[UsageEvent],
    group_by: &[String],
    window: &AggregationWindow,
) -> BillingResult<Aggregation> {
    if metric.aggregation_type == AggregationType::Custom {
        tracing::warn!(
            metric_code = %metric.code,
            aggregation = metric.aggregation_type.name(),
            "Unsupported aggregation type, quantity set to zero"
        );
    }

    let mut groups: BTreeMap<GroupKey, GroupState> = BTreeMap::new();
    for event in events
        .iter()
        .filter(|e| e.code == metric.code && e.timestamp < window.to)
        .filter(|e| metric.recurring || e.timestamp >= window.from)
    {
        let key = group_key(event, group_by);
        let state = GroupState::from_event(&metric.aggregation_type, event);
        let merged = match groups.remove(&key) {
            Some(existing) => existing.merge(state)?,
            None => state,
        };
        groups.insert(key, merged);
    }

    Ok(Aggregation {
        aggregation_type: metric.aggregation_type.clone(),
        window: *window,
        groups,
    })
}

/// Values of `keys` present on the event
fn group_key(event: &UsageEvent, keys: &[String]) -> GroupKey {
    keys.iter()
        .filter_map(|k| event.property_str(k).map(|v| (k.clone(), v)))
        .collect()
}
