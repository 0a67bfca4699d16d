//! Batch billing run
//!
//! Loads a store snapshot and computes the fees of every billable
//! subscription at one reference instant. Subscriptions are billed on the
//! blocking pool in parallel; a failing subscription is logged and skipped.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use meterbill_billing::money::sum_cents;
use meterbill_billing::{BillingEngine, MemoryStore};
use meterbill_shared::{Fee, SubscriptionId};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Fees computed for one subscription
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionFees {
    pub subscription_id: SubscriptionId,
    pub reference_instant: DateTime<Utc>,
    pub amount_cents: i64,
    pub fees: Vec<Fee>,
}

/// Outcome of a billing run
#[derive(Debug, Default)]
pub struct RunReport {
    pub billed: Vec<SubscriptionFees>,
    pub failed: Vec<SubscriptionId>,
}

pub fn load_snapshot(path: &Path) -> anyhow::Result<MemoryStore> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
    parse_snapshot(&raw).with_context(|| format!("Invalid snapshot {}", path.display()))
}

pub fn parse_snapshot(raw: &str) -> anyhow::Result<MemoryStore> {
    Ok(serde_json::from_str(raw)?)
}

/// Compute the fees of every billable subscription at `reference_instant`
pub async fn run_billing(
    engine: Arc<BillingEngine>,
    reference_instant: DateTime<Utc>,
) -> anyhow::Result<RunReport> {
    let subscription_ids = engine.billable_subscriptions()?;
    info!(
        count = subscription_ids.len(),
        reference_instant = %reference_instant,
        "Starting billing run"
    );

    let mut tasks = JoinSet::new();
    for subscription_id in subscription_ids {
        let engine = engine.clone();
        tasks.spawn_blocking(move || {
            (
                subscription_id,
                engine.compute_fees(subscription_id, reference_instant),
            )
        });
    }

    let mut report = RunReport::default();
    while let Some(joined) = tasks.join_next().await {
        let (subscription_id, result) = joined.context("Billing task panicked")?;
        let totalled = result.and_then(|fees| {
            let amount_cents = sum_cents(&fees)?;
            Ok((amount_cents, fees))
        });
        match totalled {
            Ok((amount_cents, fees)) => {
                report.billed.push(SubscriptionFees {
                    subscription_id,
                    reference_instant,
                    amount_cents,
                    fees,
                });
            }
            Err(e) => {
                error!(subscription_id = %subscription_id, error = %e, "Failed to compute fees");
                report.failed.push(subscription_id);
            }
        }
    }

    // Tasks finish in any order
    report.billed.sort_by_key(|b| b.subscription_id);
    report.failed.sort();

    info!(
        billed = report.billed.len(),
        failed = report.failed.len(),
        "Billing run complete"
    );
    Ok(report)
}
