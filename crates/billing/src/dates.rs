//! Billing period date arithmetic
//!
//! Computes where billing periods begin and end for a subscription, in the
//! subscription's timezone. Periods are half-open: `end_of_period` is the first
//! instant of the next period.

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use meterbill_shared::{BillingTime, Plan, PlanInterval, Subscription};

use crate::error::{BillingError, BillingResult};

/// Monday 2000-01-03, anchor for calendar weeks
const CALENDAR_WEEK_ANCHOR: (i32, u32, u32) = (2000, 1, 3);
/// 2000-01-01, anchor for calendar months, quarters, halves and years
const CALENDAR_MONTH_ANCHOR: (i32, u32, u32) = (2000, 1, 1);

/// Boundaries of the period containing an instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodDates {
    pub beginning_of_period: DateTime<Utc>,
    /// Start of the full period before this one, never clipped by termination
    pub previous_beginning_of_period: DateTime<Utc>,
    /// Exclusive end; the termination instant when the subscription ends
    /// before the natural end
    pub end_of_period: DateTime<Utc>,
    /// Day count of the full period, before any termination clip
    pub duration_in_days: i64,
    /// The subscription ends inside this period or exactly at its end
    pub terminated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cadence {
    Weeks,
    Months(u32),
}

impl Cadence {
    fn for_interval(interval: PlanInterval) -> Self {
        match interval.months() {
            Some(months) => Self::Months(months),
            None => Self::Weeks,
        }
    }
}

/// Period arithmetic for one subscription
#[derive(Debug, Clone, Copy)]
pub struct DatesService<'a> {
    subscription: &'a Subscription,
    plan: &'a Plan,
    timezone: Tz,
}

impl<'a> DatesService<'a> {
    pub fn new(subscription: &'a Subscription, plan: &'a Plan, timezone: Tz) -> Self {
        Self {
            subscription,
            plan,
            timezone,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    fn plan_cadence(&self) -> Cadence {
        Cadence::for_interval(self.plan.interval)
    }

    fn charges_cadence(&self) -> Cadence {
        if self.plan.is_yearly_with_monthly_charges() {
            Cadence::Months(1)
        } else {
            self.plan_cadence()
        }
    }

    /// Start of the subscription period containing `instant`
    pub fn beginning_of_period(&self, instant: DateTime<Utc>) -> BillingResult<DateTime<Utc>> {
        self.boundary(self.plan_cadence(), instant, 0)
    }

    /// Start of the subscription period before the one containing `instant`
    pub fn previous_beginning_of_period(
        &self,
        instant: DateTime<Utc>,
    ) -> BillingResult<DateTime<Utc>> {
        self.boundary(self.plan_cadence(), instant, -1)
    }

    /// Exclusive end of the subscription period containing `instant`
    pub fn end_of_period(&self, instant: DateTime<Utc>) -> BillingResult<DateTime<Utc>> {
        self.boundary(self.plan_cadence(), instant, 1)
    }

    /// Start of the charge period containing `instant`
    pub fn charges_beginning_of_period(
        &self,
        instant: DateTime<Utc>,
    ) -> BillingResult<DateTime<Utc>> {
        self.boundary(self.charges_cadence(), instant, 0)
    }

    pub fn charges_previous_beginning_of_period(
        &self,
        instant: DateTime<Utc>,
    ) -> BillingResult<DateTime<Utc>> {
        self.boundary(self.charges_cadence(), instant, -1)
    }

    pub fn charges_end_of_period(&self, instant: DateTime<Utc>) -> BillingResult<DateTime<Utc>> {
        self.boundary(self.charges_cadence(), instant, 1)
    }

    /// Subscription period dates around `instant`. When the subscription
    /// ends inside that period the end is clipped to the termination
    /// instant, while the previous boundary stays the real previous period.
    pub fn period_dates(&self, instant: DateTime<Utc>) -> BillingResult<PeriodDates> {
        self.dates_for(self.plan_cadence(), instant)
    }

    /// Charge period dates around `instant`, with the same termination rules
    /// as [`Self::period_dates`]
    pub fn charges_period_dates(&self, instant: DateTime<Utc>) -> BillingResult<PeriodDates> {
        self.dates_for(self.charges_cadence(), instant)
    }

    fn dates_for(&self, cadence: Cadence, instant: DateTime<Utc>) -> BillingResult<PeriodDates> {
        let beginning_of_period = self.boundary(cadence, instant, 0)?;
        let end_of_period = self.boundary(cadence, instant, 1)?;
        let dates = PeriodDates {
            beginning_of_period,
            previous_beginning_of_period: self.boundary(cadence, instant, -1)?,
            end_of_period,
            duration_in_days: inclusive_days(self.timezone, beginning_of_period, end_of_period),
            terminated: false,
        };

        match self.subscription.terminated_at {
            Some(terminated_at) if terminated_at <= dates.end_of_period => {
                Ok(self.terminated_period_dates(dates, terminated_at))
            }
            _ => Ok(dates),
        }
    }

    /// Ends the period at the termination instant. A termination before the
    /// period leaves it empty.
    fn terminated_period_dates(
        &self,
        dates: PeriodDates,
        terminated_at: DateTime<Utc>,
    ) -> PeriodDates {
        PeriodDates {
            end_of_period: terminated_at.max(dates.beginning_of_period),
            terminated: true,
            ..dates
        }
    }

    fn boundary(
        &self,
        cadence: Cadence,
        instant: DateTime<Utc>,
        offset: i64,
    ) -> BillingResult<DateTime<Utc>> {
        let date = local_date(self.timezone, instant);
        let index = self.period_index(cadence, date)?;
        let start = self.period_start(cadence, index + offset)?;
        Ok(local_midnight(self.timezone, start))
    }

    fn anchor(&self, cadence: Cadence) -> BillingResult<NaiveDate> {
        match self.subscription.billing_time {
            BillingTime::Anniversary => Ok(local_date(
                self.timezone,
                self.subscription.subscription_at,
            )),
            BillingTime::Calendar => {
                let (y, m, d) = match cadence {
                    Cadence::Weeks => CALENDAR_WEEK_ANCHOR,
                    Cadence::Months(_) => CALENDAR_MONTH_ANCHOR,
                };
                NaiveDate::from_ymd_opt(y, m, d)
                    .ok_or_else(|| BillingError::InvalidInput("invalid calendar anchor".to_string()))
            }
        }
    }

    /// Index of the period containing `date`, counted from the anchor
    fn period_index(&self, cadence: Cadence, date: NaiveDate) -> BillingResult<i64> {
        let anchor = self.anchor(cadence)?;
        match cadence {
            Cadence::Weeks => Ok((date - anchor).num_days().div_euclid(7)),
            Cadence::Months(step) => {
                let months_between = month_index(date) - month_index(anchor);
                let mut index = months_between.div_euclid(i64::from(step));
                if self.period_start(cadence, index)? > date {
                    index -= 1;
                }
                Ok(index)
            }
        }
    }

    /// First day of period `index`. Anniversary days past the end of a month
    /// are clamped to the month's last day, always measured from the anchor.
    fn period_start(&self, cadence: Cadence, index: i64) -> BillingResult<NaiveDate> {
        let anchor = self.anchor(cadence)?;
        let out_of_range = || BillingError::InvalidInput(format!("period {} out of range", index));

        match cadence {
            Cadence::Weeks => anchor
                .checked_add_signed(chrono::Duration::days(index * 7))
                .ok_or_else(out_of_range),
            Cadence::Months(step) => {
                let months = index * i64::from(step);
                let magnitude = u32::try_from(months.unsigned_abs()).map_err(|_| out_of_range())?;
                if months >= 0 {
                    anchor.checked_add_months(Months::new(magnitude))
                } else {
                    anchor.checked_sub_months(Months::new(magnitude))
                }
                .ok_or_else(out_of_range)
            }
        }
    }
}

fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

/// Calendar date of `instant` in `tz`
pub fn local_date(tz: Tz, instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// First instant of `date` in `tz`. When midnight falls in a DST gap the
/// first valid instant after the gap is used.
pub fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Day on which an exclusive period end falls: a partial last day counts
/// as a full day, a midnight end does not.
pub fn end_day(tz: Tz, to: DateTime<Utc>) -> NaiveDate {
    let local = to.with_timezone(&tz);
    let date = local.date_naive();
    if local.time() == NaiveTime::MIN {
        date
    } else {
        date.succ_opt().unwrap_or(date)
    }
}

/// Number of calendar days touched by `[from, to)` in `tz`
pub fn inclusive_days(tz: Tz, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    if to <= from {
        return 0;
    }
    (end_day(tz, to) - local_date(tz, from)).num_days()
}
