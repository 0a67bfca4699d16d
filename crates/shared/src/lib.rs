//! meterbill Shared Types
//!
//! This crate contains the domain records shared by the billing engine and its drivers:
//! subscriptions, plans, charges, events and fees.

pub mod currency;
pub mod error;
pub mod types;

pub use currency::Currency;
pub use error::*;
pub use types::*;
