//! Time-weighted units for fixed charges
//!
//! A fixed charge is a quantity that changes over time through
//! [`FixedChargeEvent`]s. Each event holds its units from its timestamp until
//! the next event; the billed quantity is the day-weighted average over the
//! charge period.
//!
//! Events may arrive out of order. An event is ignored when another selected
//! event has an earlier timestamp but was ingested after it: the late arrival
//! corrects a transition the ignored event had already superseded.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use meterbill_shared::FixedChargeEvent;
use rust_decimal::Decimal;

use crate::dates::{end_day, local_date};

/// Time window fixed-charge units are averaged over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProrationWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Day count of the full charge period, the proration denominator
    pub charges_duration_in_days: i64,
    pub timezone: Tz,
}

/// Day-weighted units over the window
pub fn prorate(events: &[FixedChargeEvent], window: &ProrationWindow) -> Decimal {
    if window.charges_duration_in_days <= 0 || window.to <= window.from {
        return Decimal::ZERO;
    }

    let survivors = effective_events(events, window);
    let duration = Decimal::from(window.charges_duration_in_days);
    let start_day = |instant: DateTime<Utc>| local_date(window.timezone, instant);

    let mut total = Decimal::ZERO;
    for (i, event) in survivors.iter().enumerate() {
        let start = event.timestamp.max(window.from);
        let end_date = match survivors.get(i + 1) {
            Some(next) => start_day(next.timestamp.max(window.from)),
            None => end_day(window.timezone, window.to),
        };

        // weight (days / duration) applied to the units
        let days = (end_date - start_day(start)).num_days().max(0);
        total += (Decimal::from(days) * event.units / duration).max(Decimal::ZERO);
    }

    total
}

/// Units in effect at the end of the window, without time weighting
pub fn units_at_end(events: &[FixedChargeEvent], window: &ProrationWindow) -> Decimal {
    effective_events(events, window)
        .into_iter()
        .filter(|e| e.timestamp < window.to)
        .max_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.ingested_at.cmp(&b.ingested_at))
        })
        .map(|e| e.units.max(Decimal::ZERO))
        .unwrap_or(Decimal::ZERO)
}

/// Scale a full-period quantity to the elapsed part of the period
pub fn preview_units(full_quantity: Decimal, elapsed_days: i64, full_period_days: i64) -> Decimal {
    if full_period_days <= 0 {
        return Decimal::ZERO;
    }
    if elapsed_days >= full_period_days {
        return full_quantity;
    }

    full_quantity * Decimal::from(elapsed_days.max(0)) / Decimal::from(full_period_days)
}

/// Events in the window plus the carry-in, stale events dropped, in
/// ingestion order
fn effective_events<'a>(
    events: &'a [FixedChargeEvent],
    window: &ProrationWindow,
) -> Vec<&'a FixedChargeEvent> {
    let carry_in = events
        .iter()
        .filter(|e| e.timestamp < window.from)
        .max_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.ingested_at.cmp(&b.ingested_at))
        });

    let selected: Vec<&FixedChargeEvent> = carry_in
        .into_iter()
        .chain(
            events
                .iter()
                .filter(|e| e.timestamp >= window.from && e.timestamp <= window.to),
        )
        .collect();

    let mut survivors: Vec<&FixedChargeEvent> = selected
        .iter()
        .copied()
        .filter(|event| {
            let stale = selected
                .iter()
                .any(|other| other.timestamp < event.timestamp && other.ingested_at > event.ingested_at);
            if stale {
                tracing::debug!(
                    charge_id = %event.charge_id,
                    timestamp = %event.timestamp,
                    ingested_at = %event.ingested_at,
                    "Ignoring fixed charge event superseded by a late correction"
                );
            }
            !stale
        })
        .collect();

    survivors.sort_by(|a, b| {
        a.ingested_at
            .cmp(&b.ingested_at)
            .then(a.timestamp.cmp(&b.timestamp))
    });
    survivors
}
