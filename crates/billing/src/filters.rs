//! Charge filter matching
//!
//! A filter covers the groups whose key set is exactly the filter's keys and
//! whose values are all accepted by the filter. Usage matching no filter is
//! billed on a default line priced with the charge's own model.

use std::collections::BTreeMap;

use meterbill_shared::{Charge, ChargeFilter, ChargeModel};

use crate::aggregation::{Aggregation, GroupKey, Quantity};
use crate::error::BillingResult;

/// Quantity attributed to one filter, or to the default line when `filter`
/// is `None`
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredQuantity<'a> {
    pub filter: Option<&'a ChargeFilter>,
    pub quantity: Quantity,
}

/// Pricing model of a line: the filter's override, else the charge's model
pub fn line_charge_model<'c>(charge: &'c Charge, filter: Option<&'c ChargeFilter>) -> &'c ChargeModel {
    filter
        .and_then(|f| f.charge_model.as_ref())
        .unwrap_or(&charge.charge_model)
}

/// Whether `group`, projected on the filter's keys, is covered by `filter`
pub fn filter_matches(filter: &ChargeFilter, group: &GroupKey) -> bool {
    let projected = project(group, filter);
    projected.keys().copied().eq(filter.values.keys())
        && filter.values.iter().all(|(key, accepted)| {
            projected
                .get(key)
                .map(|value| accepted.contains(*value))
                .unwrap_or(false)
        })
}

fn project<'g>(group: &'g GroupKey, filter: &ChargeFilter) -> BTreeMap<&'g String, &'g String> {
    group
        .iter()
        .filter(|(k, _)| filter.values.contains_key(*k))
        .collect()
}

/// Keys to group usage by so every filter can be evaluated
pub fn filter_keys(charge: &Charge) -> Vec<String> {
    let mut keys: Vec<String> = charge.filters.iter().flat_map(|f| f.keys()).collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Split an aggregation across the charge's filters. Without filters the
/// whole aggregation is returned as a single unfiltered line.
pub fn filter_quantities<'a>(
    charge: &'a Charge,
    aggregation: &Aggregation,
) -> BillingResult<Vec<FilteredQuantity<'a>>> {
    if charge.filters.is_empty() {
        return Ok(vec![FilteredQuantity {
            filter: None,
            quantity: aggregation.total()?,
        }]);
    }

    let mut lines = charge
        .filters
        .iter()
        .map(|filter| {
            Ok(FilteredQuantity {
                filter: Some(filter),
                quantity: aggregation.quantity_where(|group| filter_matches(filter, group))?,
            })
        })
        .collect::<BillingResult<Vec<FilteredQuantity<'a>>>>()?;

    lines.push(FilteredQuantity {
        filter: None,
        quantity: aggregation
            .quantity_where(|group| !charge.filters.iter().any(|f| filter_matches(f, group)))?,
    });

    Ok(lines)
}
