//! Period boundary resolution
//!
//! Resolves the subscription period and charge period a billing run covers,
//! clipped to the subscription's start and termination.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use meterbill_shared::{FeeProperties, Plan, Subscription};
use rust_decimal::Decimal;

use crate::aggregation::AggregationWindow;
use crate::dates::{inclusive_days, local_date, DatesService, PeriodDates};
use crate::error::BillingResult;
use crate::proration::ProrationWindow;

/// Boundaries of one billing run for one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodBoundaries {
    /// Instant the run was resolved for
    pub timestamp: DateTime<Utc>,
    pub from_datetime: DateTime<Utc>,
    pub to_datetime: DateTime<Utc>,
    pub charges_from_datetime: DateTime<Utc>,
    pub charges_to_datetime: DateTime<Utc>,
    /// Day count of the full charge period before clipping
    pub charges_duration_in_days: i64,
    /// Day count of the full subscription period before clipping
    pub period_duration_in_days: i64,
    pub issuing_date: NaiveDate,
    pub timezone: Tz,
    /// The subscription ends inside this charge period or exactly at its end
    pub terminated: bool,
}

impl PeriodBoundaries {
    /// No time elapsed in the charge period
    pub fn is_empty(&self) -> bool {
        self.charges_to_datetime <= self.charges_from_datetime
    }

    pub fn charges_days(&self) -> i64 {
        inclusive_days(self.timezone, self.charges_from_datetime, self.charges_to_datetime)
    }

    pub fn period_days(&self) -> i64 {
        inclusive_days(self.timezone, self.from_datetime, self.to_datetime)
    }

    /// Elapsed share of the charge period, in `[0, 1]`
    pub fn charges_coefficient(&self) -> Decimal {
        coefficient(self.charges_days(), self.charges_duration_in_days)
    }

    /// Elapsed share of the subscription period, in `[0, 1]`
    pub fn period_coefficient(&self) -> Decimal {
        coefficient(self.period_days(), self.period_duration_in_days)
    }

    pub fn proration_window(&self) -> ProrationWindow {
        ProrationWindow {
            from: self.charges_from_datetime,
            to: self.charges_to_datetime,
            charges_duration_in_days: self.charges_duration_in_days,
            timezone: self.timezone,
        }
    }

    pub fn aggregation_window(&self) -> AggregationWindow {
        AggregationWindow {
            from: self.charges_from_datetime,
            to: self.charges_to_datetime,
        }
    }

    /// Snapshot stored on every fee computed for this period
    pub fn fee_properties(&self) -> FeeProperties {
        FeeProperties {
            from_datetime: self.from_datetime,
            to_datetime: self.to_datetime,
            charges_from_datetime: self.charges_from_datetime,
            charges_to_datetime: self.charges_to_datetime,
            timestamp: self.timestamp,
            charges_duration_in_days: self.charges_duration_in_days,
        }
    }
}

fn coefficient(days: i64, full_days: i64) -> Decimal {
    if full_days <= 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(days) / Decimal::from(full_days)).min(Decimal::ONE)
}

/// Resolve the period billed at `reference_instant`.
///
/// With `current_usage` the period containing the instant is returned,
/// otherwise the period that ended at or just before it.
pub fn resolve(
    subscription: &Subscription,
    plan: &Plan,
    reference_instant: DateTime<Utc>,
    current_usage: bool,
    timezone: Tz,
) -> BillingResult<PeriodBoundaries> {
    let dates = DatesService::new(subscription, plan, timezone);

    let charges = if current_usage {
        dates.charges_period_dates(reference_instant)?
    } else {
        dates.charges_period_dates(dates.charges_previous_beginning_of_period(reference_instant)?)?
    };

    let period = if plan.is_yearly_with_monthly_charges() {
        dates.period_dates(charges.beginning_of_period)?
    } else if current_usage {
        dates.period_dates(reference_instant)?
    } else {
        dates.period_dates(dates.previous_beginning_of_period(reference_instant)?)?
    };

    let (from, to) = clip_to_start(subscription, &period);
    let (charges_from, charges_to) = clip_to_start(subscription, &charges);

    Ok(PeriodBoundaries {
        timestamp: reference_instant,
        from_datetime: from,
        to_datetime: to,
        charges_from_datetime: charges_from,
        charges_to_datetime: charges_to,
        charges_duration_in_days: charges.duration_in_days,
        period_duration_in_days: period.duration_in_days,
        issuing_date: local_date(timezone, reference_instant),
        timezone,
        terminated: charges.terminated,
    })
}

/// Resolve the last period of a subscription terminated at `terminated_at`.
///
/// A termination inside a charge period cuts that period short. A
/// termination on a boundary ends the period that just closed.
pub fn resolve_final(
    subscription: &Subscription,
    plan: &Plan,
    terminated_at: DateTime<Utc>,
    timezone: Tz,
) -> BillingResult<PeriodBoundaries> {
    let dates = DatesService::new(subscription, plan, timezone);
    let mid_period = dates.charges_beginning_of_period(terminated_at)? < terminated_at;
    resolve(subscription, plan, terminated_at, mid_period, timezone)
}

/// Clip the period to the subscription's start; the result never has
/// `to < from`
fn clip_to_start(
    subscription: &Subscription,
    dates: &PeriodDates,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let to = dates.end_of_period;
    let from = dates.beginning_of_period.max(subscription.started_at).min(to);
    (from, to)
}
