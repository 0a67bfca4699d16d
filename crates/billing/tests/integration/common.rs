//! Fixture builders shared by the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use meterbill_billing::{BillingEngine, EngineConfig, MemoryStore};
use meterbill_shared::{
    AggregationType, BillableMetric, BillableMetricId, BillingTime, Charge, ChargeId, ChargeKind,
    ChargeModel, Currency, FixedChargeEvent, MinimumCommitment, MinimumCommitmentId, Plan, PlanId,
    PlanInterval, Subscription, SubscriptionId, SubscriptionStatus, UsageEvent,
};
use rust_decimal::Decimal;

pub fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

/// Midnight UTC of June 1st 2024, start of most test periods
pub fn t0() -> DateTime<Utc> {
    utc(2024, 6, 1)
}

pub fn days(n: i64) -> DateTime<Utc> {
    t0() + Duration::days(n)
}

pub fn fixed_charge(unit_price: Decimal, prorated: bool) -> Charge {
    Charge {
        id: ChargeId::new(),
        kind: ChargeKind::Fixed,
        charge_model: ChargeModel::Standard { amount: unit_price },
        pay_in_advance: false,
        prorated,
        invoiceable: true,
        min_amount_cents: None,
        filters: vec![],
        grouping_keys: vec![],
    }
}

pub fn metered_charge(code: &str, aggregation_type: AggregationType, model: ChargeModel) -> Charge {
    Charge {
        id: ChargeId::new(),
        kind: ChargeKind::Metered {
            billable_metric: BillableMetric {
                id: BillableMetricId::new(),
                code: code.to_string(),
                aggregation_type,
                recurring: false,
            },
        },
        charge_model: model,
        pay_in_advance: false,
        prorated: false,
        invoiceable: true,
        min_amount_cents: None,
        filters: vec![],
        grouping_keys: vec![],
    }
}

pub fn plan(interval: PlanInterval, amount_cents: i64, charges: Vec<Charge>) -> Plan {
    Plan {
        id: PlanId::new(),
        code: "scale".to_string(),
        interval,
        pay_in_advance: false,
        bill_charges_monthly: false,
        amount_cents,
        currency: Currency::Usd,
        charges,
        minimum_commitment: None,
    }
}

pub fn with_commitment(mut plan: Plan, amount_cents: i64) -> Plan {
    plan.minimum_commitment = Some(MinimumCommitment {
        id: MinimumCommitmentId::new(),
        plan_id: plan.id,
        amount_cents,
        invoice_display_name: Some("Minimum spend".to_string()),
    });
    plan
}

pub fn subscription(plan: &Plan, started_at: DateTime<Utc>) -> Subscription {
    Subscription {
        id: SubscriptionId::new(),
        external_id: format!("sub_{}", plan.code),
        plan_id: plan.id,
        status: SubscriptionStatus::Active,
        billing_time: BillingTime::Calendar,
        started_at,
        subscription_at: started_at,
        terminated_at: None,
        customer_timezone: None,
        organization_timezone: None,
    }
}

pub fn fixed_event(
    subscription: &Subscription,
    charge: &Charge,
    timestamp: DateTime<Utc>,
    ingested_at: DateTime<Utc>,
    units: Decimal,
) -> FixedChargeEvent {
    FixedChargeEvent {
        subscription_id: subscription.id,
        charge_id: charge.id,
        timestamp,
        ingested_at,
        units,
    }
}

pub fn usage_event(
    subscription: &Subscription,
    code: &str,
    timestamp: DateTime<Utc>,
    properties: &[(&str, serde_json::Value)],
) -> UsageEvent {
    UsageEvent {
        transaction_id: format!("tr_{}_{}", code, timestamp.timestamp_nanos_opt().unwrap_or(0)),
        subscription_id: subscription.id,
        code: code.to_string(),
        timestamp,
        ingested_at: timestamp,
        properties: properties
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
    }
}

pub fn store(plan: &Plan, subscription: &Subscription) -> MemoryStore {
    let mut store = MemoryStore::new();
    store.add_plan(plan.clone());
    store.add_subscription(subscription.clone());
    store
}

pub fn engine(store: MemoryStore) -> BillingEngine {
    engine_with(store, EngineConfig::default())
}

pub fn engine_with(store: MemoryStore, config: EngineConfig) -> BillingEngine {
    let store = Arc::new(store);
    BillingEngine::new(store.clone(), store.clone(), store, config)
}
