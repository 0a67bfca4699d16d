//! End-to-end billing periods through the engine

use std::collections::BTreeMap;

use chrono::{Duration, TimeZone, Utc};
use meterbill_billing::EngineConfig;
use meterbill_shared::{
    AggregationType, ChargeFilter, ChargeFilterId, ChargeModel, FeeType, PlanInterval,
    SubscriptionStatus,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use crate::common::*;

// ============================================================================
// Fixed charge proration
// ============================================================================

#[test]
fn test_single_event_covers_full_period() {
    let charge = fixed_charge(dec!(1), true);
    let plan = plan(PlanInterval::Monthly, 0, vec![charge.clone()]);
    let sub = subscription(&plan, t0());
    let mut store = store(&plan, &sub);
    store.add_fixed_charge_event(fixed_event(&sub, &charge, t0(), t0(), dec!(100)));

    let fees = engine(store).compute_fees(sub.id, days(30)).unwrap();
    let fee = fees.iter().find(|f| f.charge_id == Some(charge.id)).unwrap();

    assert_eq!(fee.units, dec!(100));
    assert_eq!(fee.amount_cents, 10_000);
    assert_eq!(fee.properties.charges_duration_in_days, 30);
}

#[test]
fn test_carry_in_value_until_mid_period_change() {
    let charge = fixed_charge(dec!(1), true);
    let plan = plan(PlanInterval::Monthly, 0, vec![charge.clone()]);
    let sub = subscription(&plan, utc(2024, 1, 1));
    let mut store = store(&plan, &sub);
    store.add_fixed_charge_event(fixed_event(&sub, &charge, days(-5), days(-5), dec!(50)));
    store.add_fixed_charge_event(fixed_event(&sub, &charge, days(15), days(15), dec!(200)));

    let fees = engine(store).compute_fees(sub.id, days(30)).unwrap();
    let fee = fees.iter().find(|f| f.charge_id == Some(charge.id)).unwrap();

    // 50 for 15 days, 200 for 15 days
    assert_eq!(fee.units, dec!(125));
    assert_eq!(fee.amount_cents, 12_500);
}

#[test]
fn test_out_of_order_events() {
    let charge = fixed_charge(dec!(1), true);
    let plan = plan(PlanInterval::Monthly, 0, vec![charge.clone()]);
    let sub = subscription(&plan, t0());

    // Later change ingested later: both count
    let mut in_order = store(&plan, &sub);
    in_order.add_fixed_charge_event(fixed_event(
        &sub,
        &charge,
        days(5),
        days(5) + Duration::hours(1),
        dec!(10),
    ));
    in_order.add_fixed_charge_event(fixed_event(
        &sub,
        &charge,
        days(10),
        days(10) + Duration::hours(2),
        dec!(40),
    ));
    let fees = engine(in_order).compute_fees(sub.id, days(30)).unwrap();
    let fee = fees.iter().find(|f| f.charge_id == Some(charge.id)).unwrap();
    assert_eq!(fee.units, dec!(10) * dec!(5) / dec!(30) + dec!(40) * dec!(20) / dec!(30));
    assert_eq!(fee.amount_cents, 2_833);

    // Correction to day 3 recorded after the day 10 change: the day 10 change is dropped
    let mut corrected = store(&plan, &sub);
    corrected.add_fixed_charge_event(fixed_event(&sub, &charge, days(10), days(10), dec!(40)));
    corrected.add_fixed_charge_event(fixed_event(&sub, &charge, days(3), days(12), dec!(10)));
    let fees = engine(corrected).compute_fees(sub.id, days(30)).unwrap();
    let fee = fees.iter().find(|f| f.charge_id == Some(charge.id)).unwrap();
    // 10 units for 27 of 30 days
    assert_eq!(fee.units, dec!(9));
    assert_eq!(fee.amount_cents, 900);
}

#[test]
fn test_termination_prorates_plan_and_fixed_charge() {
    let charge = fixed_charge(dec!(1), true);
    let plan = plan(PlanInterval::Monthly, 3_000, vec![charge.clone()]);
    let mut sub = subscription(&plan, utc(2024, 1, 1));
    sub.status = SubscriptionStatus::Terminated;
    sub.terminated_at = Some(days(9) + Duration::hours(12));
    let mut store = store(&plan, &sub);
    store.add_fixed_charge_event(fixed_event(&sub, &charge, days(-20), days(-20), dec!(30)));

    let fees = engine(store).compute_fees(sub.id, days(30)).unwrap();

    let plan_fee = fees.iter().find(|f| f.fee_type == FeeType::Subscription).unwrap();
    assert_eq!(plan_fee.amount_cents, 1_000);
    assert_eq!(plan_fee.properties.to_datetime, days(9) + Duration::hours(12));

    let fixed = fees.iter().find(|f| f.charge_id == Some(charge.id)).unwrap();
    assert_eq!(fixed.units, dec!(10));
}

#[test]
fn test_termination_at_period_end_bills_the_full_period() {
    let charge = fixed_charge(dec!(1), true);
    let plan = plan(PlanInterval::Monthly, 3_000, vec![charge.clone()]);
    let mut sub = subscription(&plan, t0());
    sub.status = SubscriptionStatus::Terminated;
    sub.terminated_at = Some(days(30));
    let mut store = store(&plan, &sub);
    store.add_fixed_charge_event(fixed_event(&sub, &charge, t0(), t0(), dec!(100)));

    let fees = engine(store).compute_fees(sub.id, days(30)).unwrap();

    let fixed = fees.iter().find(|f| f.charge_id == Some(charge.id)).unwrap();
    assert_eq!(fixed.properties.charges_from_datetime, t0());
    assert_eq!(fixed.properties.charges_to_datetime, days(30));
    assert_eq!(fixed.units, dec!(100));
    assert_eq!(fixed.amount_cents, 10_000);

    let plan_fee = fees.iter().find(|f| f.fee_type == FeeType::Subscription).unwrap();
    assert_eq!(plan_fee.amount_cents, 3_000);
}

// ============================================================================
// Zero-duration periods
// ============================================================================

#[test]
fn test_terminated_at_start_yields_only_zero_fees() {
    let mut fixed = fixed_charge(dec!(1), true);
    fixed.min_amount_cents = Some(5_000);
    let mut metered = metered_charge(
        "api_calls",
        AggregationType::Count,
        ChargeModel::Standard { amount: dec!(0.1) },
    );
    metered.filters = vec![ChargeFilter {
        id: ChargeFilterId::new(),
        values: BTreeMap::from([("region".to_string(), vec!["eu".to_string()])]),
        charge_model: None,
        invoice_display_name: None,
    }];
    let plan = plan(PlanInterval::Monthly, 3_000, vec![fixed.clone(), metered.clone()]);
    let mut sub = subscription(&plan, t0());
    sub.status = SubscriptionStatus::Terminated;
    sub.terminated_at = Some(t0());
    let mut store = store(&plan, &sub);
    store.add_fixed_charge_event(fixed_event(&sub, &fixed, t0(), t0(), dec!(100)));
    store.add_usage_event(usage_event(&sub, "api_calls", t0(), &[("region", json!("eu"))]));

    let fees = engine(store).compute_fees(sub.id, days(30)).unwrap();

    // plan fee, fixed charge, metered filter and default lines
    assert_eq!(fees.len(), 4);
    for fee in &fees {
        assert_eq!(fee.amount_cents, 0);
        assert!(!fee.is_true_up());
    }
    assert!(fees
        .iter()
        .filter(|f| f.fee_type == FeeType::Charge)
        .all(|f| f.units == Decimal::ZERO));
}

#[test]
fn test_zero_fees_can_be_dropped() {
    let metered = metered_charge(
        "api_calls",
        AggregationType::Count,
        ChargeModel::Standard { amount: dec!(0.1) },
    );
    let plan = plan(PlanInterval::Monthly, 0, vec![metered]);
    let sub = subscription(&plan, t0());
    let config = EngineConfig {
        emit_zero_fees: false,
        ..EngineConfig::default()
    };

    let fees = engine_with(store(&plan, &sub), config)
        .compute_fees(sub.id, days(30))
        .unwrap();

    assert!(fees.iter().all(|f| f.fee_type == FeeType::Subscription));
}

// ============================================================================
// Usage charges
// ============================================================================

#[test]
fn test_grouped_charge_bills_each_value() {
    let mut charge = metered_charge(
        "api_calls",
        AggregationType::Count,
        ChargeModel::Standard { amount: dec!(1) },
    );
    charge.grouping_keys = vec!["region".to_string()];
    let plan = plan(PlanInterval::Monthly, 0, vec![charge.clone()]);
    let sub = subscription(&plan, t0());
    let mut store = store(&plan, &sub);
    for (day, region) in [(1, "eu"), (2, "eu"), (3, "us"), (4, "eu")] {
        store.add_usage_event(usage_event(&sub, "api_calls", days(day), &[("region", json!(region))]));
    }

    let fees = engine(store).compute_fees(sub.id, days(30)).unwrap();
    let charge_fees: Vec<_> = fees.iter().filter(|f| f.charge_id == Some(charge.id)).collect();

    assert_eq!(charge_fees.len(), 2);
    let eu = charge_fees
        .iter()
        .find(|f| f.grouped_by.get("region").map(String::as_str) == Some("eu"))
        .unwrap();
    let us = charge_fees
        .iter()
        .find(|f| f.grouped_by.get("region").map(String::as_str) == Some("us"))
        .unwrap();
    assert_eq!(eu.units, dec!(3));
    assert_eq!(eu.amount_cents, 300);
    assert_eq!(us.units, dec!(1));
    assert_ne!(eu.id, us.id);
}

#[test]
fn test_filter_overrides_price_and_default_line_takes_the_rest() {
    let filter = ChargeFilter {
        id: ChargeFilterId::new(),
        values: BTreeMap::from([("region".to_string(), vec!["eu".to_string()])]),
        charge_model: Some(ChargeModel::Standard { amount: dec!(2) }),
        invoice_display_name: Some("EU calls".to_string()),
    };
    let mut charge = metered_charge(
        "api_calls",
        AggregationType::Count,
        ChargeModel::Standard { amount: dec!(1) },
    );
    charge.filters = vec![filter.clone()];
    let plan = plan(PlanInterval::Monthly, 0, vec![charge.clone()]);
    let sub = subscription(&plan, t0());
    let mut store = store(&plan, &sub);
    for (day, region) in [(1, "eu"), (2, "eu"), (3, "us"), (4, "eu")] {
        store.add_usage_event(usage_event(&sub, "api_calls", days(day), &[("region", json!(region))]));
    }

    let fees = engine(store).compute_fees(sub.id, days(30)).unwrap();

    let eu = fees.iter().find(|f| f.charge_filter_id == Some(filter.id)).unwrap();
    assert_eq!(eu.units, dec!(3));
    assert_eq!(eu.amount_cents, 600);

    let rest = fees
        .iter()
        .find(|f| f.charge_id == Some(charge.id) && f.charge_filter_id.is_none())
        .unwrap();
    assert_eq!(rest.units, dec!(1));
    assert_eq!(rest.amount_cents, 100);
}

#[test]
fn test_graduated_sum_charge() {
    let charge = metered_charge(
        "storage_gb",
        AggregationType::Sum {
            field_name: "gb".to_string(),
        },
        ChargeModel::Graduated {
            ranges: vec![
                meterbill_shared::PriceRange {
                    from_value: dec!(0),
                    to_value: Some(dec!(10)),
                    per_unit_amount: dec!(1),
                    flat_amount: dec!(0),
                },
                meterbill_shared::PriceRange {
                    from_value: dec!(10),
                    to_value: None,
                    per_unit_amount: dec!(0.5),
                    flat_amount: dec!(5),
                },
            ],
        },
    );
    let plan = plan(PlanInterval::Monthly, 0, vec![charge.clone()]);
    let sub = subscription(&plan, t0());
    let mut store = store(&plan, &sub);
    store.add_usage_event(usage_event(&sub, "storage_gb", days(2), &[("gb", json!("12"))]));
    store.add_usage_event(usage_event(&sub, "storage_gb", days(9), &[("gb", json!(8))]));

    let fees = engine(store).compute_fees(sub.id, days(30)).unwrap();
    let fee = fees.iter().find(|f| f.charge_id == Some(charge.id)).unwrap();

    // 10 x 1 + (5 + 10 x 0.5)
    assert_eq!(fee.units, dec!(20));
    assert_eq!(fee.amount_cents, 2_000);
}

// ============================================================================
// Periods
// ============================================================================

#[test]
fn test_customer_timezone_aligns_periods() {
    let charge = metered_charge(
        "api_calls",
        AggregationType::Count,
        ChargeModel::Standard { amount: dec!(1) },
    );
    let plan = plan(PlanInterval::Monthly, 0, vec![charge.clone()]);
    let mut sub = subscription(&plan, Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap());
    sub.customer_timezone = Some(chrono_tz::America::New_York);
    sub.organization_timezone = Some(chrono_tz::Asia::Tokyo);
    let mut store = store(&plan, &sub);
    // May 31st, June 30th and June 30th late evening in New York
    for instant in [
        Utc.with_ymd_and_hms(2024, 6, 1, 2, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 6, 30, 23, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 7, 1, 3, 0, 0).unwrap(),
    ] {
        store.add_usage_event(usage_event(&sub, "api_calls", instant, &[]));
    }

    let reference = Utc.with_ymd_and_hms(2024, 7, 1, 4, 0, 0).unwrap();
    let fees = engine(store).compute_fees(sub.id, reference).unwrap();
    let fee = fees.iter().find(|f| f.charge_id == Some(charge.id)).unwrap();

    assert_eq!(
        fee.properties.charges_from_datetime,
        Utc.with_ymd_and_hms(2024, 6, 1, 4, 0, 0).unwrap()
    );
    assert_eq!(fee.properties.charges_to_datetime, reference);
    assert_eq!(fee.units, dec!(2));
}

#[test]
fn test_yearly_plan_fee_billed_with_last_monthly_charges() {
    let mut plan = plan(PlanInterval::Yearly, 12_000, vec![fixed_charge(dec!(1), false)]);
    plan.bill_charges_monthly = true;
    let sub = subscription(&plan, utc(2024, 1, 1));
    let engine = engine(store(&plan, &sub));

    let july = engine.compute_fees(sub.id, utc(2024, 7, 1)).unwrap();
    assert!(july.iter().all(|f| f.fee_type != FeeType::Subscription));
    let charge_fee = july.iter().find(|f| f.fee_type == FeeType::Charge).unwrap();
    assert_eq!(charge_fee.properties.charges_from_datetime, utc(2024, 6, 1));
    assert_eq!(charge_fee.properties.from_datetime, utc(2024, 1, 1));

    let january = engine.compute_fees(sub.id, utc(2025, 1, 1)).unwrap();
    let plan_fee = january.iter().find(|f| f.fee_type == FeeType::Subscription).unwrap();
    assert_eq!(plan_fee.amount_cents, 12_000);
}

#[test]
fn test_pay_in_advance_plan_bills_upcoming_period() {
    let mut plan = plan(PlanInterval::Monthly, 3_000, vec![]);
    plan.pay_in_advance = true;
    let sub = subscription(&plan, utc(2024, 1, 1));

    let fees = engine(store(&plan, &sub)).compute_fees(sub.id, utc(2024, 7, 1)).unwrap();
    let plan_fee = fees.iter().find(|f| f.fee_type == FeeType::Subscription).unwrap();

    assert!(plan_fee.pay_in_advance);
    assert_eq!(plan_fee.amount_cents, 3_000);
    assert_eq!(plan_fee.properties.from_datetime, utc(2024, 7, 1));
    assert_eq!(plan_fee.properties.to_datetime, utc(2024, 8, 1));
}

#[test]
fn test_current_usage_reports_period_so_far() {
    let charge = metered_charge(
        "api_calls",
        AggregationType::Count,
        ChargeModel::Standard { amount: dec!(0.25) },
    );
    let plan = plan(PlanInterval::Monthly, 0, vec![charge]);
    let sub = subscription(&plan, utc(2024, 1, 1));
    let mut store = store(&plan, &sub);
    for day in 0..8 {
        store.add_usage_event(usage_event(&sub, "api_calls", days(day), &[]));
    }

    let usage = engine(store).current_usage(sub.id, days(8)).unwrap();

    assert_eq!(usage.charges_from_datetime, t0());
    assert_eq!(usage.charges_to_datetime, days(30));
    assert_eq!(usage.amount_cents, 200);
    assert_eq!(usage.fees.len(), 1);
}
