//! Property tests over generated event streams

use chrono::Duration;
use meterbill_billing::money::shortfall;
use meterbill_billing::{prorate, ProrationWindow};
use meterbill_shared::{
    AggregationType, ChargeId, ChargeModel, Fee, FixedChargeEvent, InvoiceId, InvoiceSubscription,
    InvoiceSubscriptionId, PlanInterval, SubscriptionId,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use crate::common::*;

/// (timestamp day, ingestion hour, units in cents of a unit)
type RawEvent = (i64, i64, i64);

fn raw_events() -> impl Strategy<Value = Vec<RawEvent>> {
    prop::collection::vec((-10i64..30, 0i64..1_000, -500i64..50_000), 0..8)
}

fn to_fixed_events(raw: &[RawEvent]) -> Vec<FixedChargeEvent> {
    raw.iter()
        .map(|&(day, hour, units)| FixedChargeEvent {
            subscription_id: SubscriptionId::default(),
            charge_id: ChargeId::default(),
            timestamp: days(day),
            ingested_at: days(-10) + Duration::hours(hour),
            units: Decimal::new(units, 2),
        })
        .collect()
}

fn window(from_day: i64, to_day: i64, duration: i64) -> ProrationWindow {
    ProrationWindow {
        from: days(from_day),
        to: days(to_day),
        charges_duration_in_days: duration,
        timezone: chrono_tz::UTC,
    }
}

/// Fees of June for a plan mixing prorated, non-prorated and metered charges
fn june_fees(raw: &[RawEvent], usage: &[i64], start_day: i64, plan_cents: i64) -> Vec<Fee> {
    let mut prorated = fixed_charge(dec!(1.5), true);
    prorated.min_amount_cents = Some(500);
    let flat = fixed_charge(dec!(3), false);
    let metered = metered_charge(
        "bandwidth",
        AggregationType::Sum {
            field_name: "gb".to_string(),
        },
        ChargeModel::Standard { amount: dec!(0.1) },
    );
    let plan = plan(
        PlanInterval::Monthly,
        plan_cents,
        vec![prorated.clone(), flat.clone(), metered],
    );
    let sub = subscription(&plan, days(start_day));
    let mut store = store(&plan, &sub);
    for event in to_fixed_events(raw) {
        store.add_fixed_charge_event(fixed_event(&sub, &prorated, event.timestamp, event.ingested_at, event.units));
        store.add_fixed_charge_event(fixed_event(&sub, &flat, event.timestamp, event.ingested_at, event.units));
    }
    for (i, gb) in usage.iter().enumerate() {
        let day = (i as i64) % 30;
        store.add_usage_event(usage_event(&sub, "bandwidth", days(day) + Duration::minutes(i as i64), &[("gb", json!(gb))]));
    }

    engine(store).compute_fees(sub.id, days(30)).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_fees_are_idempotent(
        raw in raw_events(),
        usage in prop::collection::vec(-50i64..500, 0..20),
        start_day in -40i64..25,
        plan_cents in 0i64..10_000,
    ) {
        let first = june_fees(&raw, &usage, start_day, plan_cents);
        let second = june_fees(&raw, &usage, start_day, plan_cents);

        // Ids embed the random subscription, compare everything else
        prop_assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            prop_assert_eq!(a.amount_cents, b.amount_cents);
            prop_assert_eq!(a.units, b.units);
            prop_assert_eq!(&a.properties, &b.properties);
            prop_assert_eq!(&a.amount_details, &b.amount_details);
        }
    }

    #[test]
    fn test_fees_are_never_negative(
        raw in raw_events(),
        usage in prop::collection::vec(-500i64..500, 0..20),
        start_day in -40i64..25,
        plan_cents in 0i64..10_000,
    ) {
        for fee in june_fees(&raw, &usage, start_day, plan_cents) {
            prop_assert!(fee.units >= Decimal::ZERO, "negative units {:?}", fee);
            prop_assert!(fee.amount_cents >= 0, "negative amount {:?}", fee);
        }
    }

    #[test]
    fn test_prorated_units_bounded_by_active_maximum(raw in raw_events()) {
        let events = to_fixed_events(&raw);
        let w = window(0, 30, 30);

        let carry_in = events
            .iter()
            .filter(|e| e.timestamp < w.from)
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.ingested_at.cmp(&b.ingested_at)));
        let active_max = carry_in
            .into_iter()
            .chain(events.iter().filter(|e| e.timestamp >= w.from && e.timestamp <= w.to))
            .map(|e| e.units)
            .max()
            .unwrap_or(Decimal::ZERO)
            .max(Decimal::ZERO);

        let units = prorate(&events, &w);
        prop_assert!(units >= Decimal::ZERO);
        // per-span division may round up in the last decimal place
        prop_assert!(units <= active_max + Decimal::new(1, 20), "{} > {}", units, active_max);
    }

    #[test]
    fn test_proration_conserved_across_adjacent_windows(
        duration in 2i64..60,
        split in 1i64..59,
        units in 0i64..1_000_000,
    ) {
        let split = split.min(duration - 1);
        let events = vec![FixedChargeEvent {
            subscription_id: SubscriptionId::default(),
            charge_id: ChargeId::default(),
            timestamp: t0(),
            ingested_at: t0(),
            units: Decimal::new(units, 2),
        }];

        let head = prorate(&events, &window(0, split, duration));
        let tail = prorate(&events, &window(split, duration, duration));
        let whole = prorate(&events, &window(0, duration, duration));

        prop_assert!((head + tail - whole).abs() <= Decimal::new(1, 20));
        prop_assert_eq!(whole, Decimal::new(units, 2));
    }

    #[test]
    fn test_shortfall_floor(target in -1_000_000i64..1_000_000, actual in -1_000_000i64..1_000_000) {
        let amount = shortfall(target, actual);
        prop_assert!(amount >= 0);
        if target > actual {
            prop_assert_eq!(amount, target - actual);
        } else {
            prop_assert_eq!(amount, 0);
        }
    }

    #[test]
    fn test_commitment_true_up_floor(commitment_cents in 0i64..20_000, units in 0i64..300) {
        let charge = fixed_charge(dec!(1), false);
        let plan = with_commitment(plan(PlanInterval::Monthly, 0, vec![charge.clone()]), commitment_cents);
        let sub = subscription(&plan, t0());
        let mut store = store(&plan, &sub);
        store.add_fixed_charge_event(fixed_event(&sub, &charge, t0(), t0(), Decimal::from(units)));

        let fees = engine(store.clone()).compute_fees(sub.id, days(30)).unwrap();
        let invoice_subscription = InvoiceSubscription {
            id: InvoiceSubscriptionId::new(),
            invoice_id: InvoiceId::new(),
            subscription_id: sub.id,
            timestamp: days(30),
            from_datetime: t0(),
            to_datetime: days(30),
            charges_from_datetime: t0(),
            charges_to_datetime: days(30),
        };
        store.add_fees(fees.into_iter().map(|fee| Fee {
            invoice_id: Some(invoice_subscription.invoice_id),
            ..fee
        }));
        store.add_invoice_subscription(invoice_subscription.clone());

        let commitment_id = plan.minimum_commitment.as_ref().map(|c| c.id).unwrap();
        let true_up = engine(store)
            .compute_true_up(commitment_id, invoice_subscription.id)
            .unwrap();

        let difference = commitment_cents - units * 100;
        match true_up {
            Some(fee) => {
                prop_assert!(difference > 0);
                prop_assert_eq!(fee.amount_cents, difference);
            }
            None => prop_assert!(difference <= 0),
        }
    }
}
