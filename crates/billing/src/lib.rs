//! meterbill Billing Engine
//!
//! Computes the fees of a subscription billing period: the plan fee, usage
//! and fixed charge fees priced through the charge models, per-charge minimum
//! true-ups and plan minimum commitment true-ups.
//!
//! Every computation is a pure function of the stored records and the
//! reference instant it is given, so recomputing a period yields the same
//! fees with the same identifiers.

pub mod aggregation;
pub mod boundaries;
pub mod charge_models;
pub mod commitment;
pub mod config;
pub mod dates;
pub mod engine;
pub mod error;
pub mod fees;
pub mod filters;
pub mod money;
pub mod proration;
pub mod store;

pub use aggregation::{aggregate, Aggregation, AggregationWindow, GroupKey, Quantity};
pub use boundaries::{resolve, resolve_final, PeriodBoundaries};
pub use charge_models::PricedAmount;
pub use commitment::CommitmentCalculator;
pub use config::EngineConfig;
pub use dates::{inclusive_days, DatesService, PeriodDates};
pub use engine::{BillingEngine, CurrentUsage};
pub use error::{BillingError, BillingResult};
pub use fees::FeeBuilder;
pub use filters::{filter_quantities, line_charge_model, FilteredQuantity};
pub use proration::{prorate, ProrationWindow};
pub use store::{CatalogStore, EventStore, FeeQuery, FeeStore, MemoryStore};
