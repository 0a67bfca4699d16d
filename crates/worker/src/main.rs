//! meterbill Worker
//!
//! Batch driver for the billing engine: loads a store snapshot, bills every
//! billable subscription at the reference instant and prints one JSON line
//! per subscription on stdout.
//!
//! Configuration (environment or `.env`):
//! - `BILLING_SNAPSHOT_PATH`: snapshot file, overridden by the first argument
//! - `BILLING_REFERENCE_INSTANT`: RFC 3339 instant to bill at (default: now)
//! - `BILLING_DEFAULT_TIMEZONE`, `BILLING_EMIT_ZERO_FEES`: engine settings
//! - `RUST_LOG`: log filter (default: info)

mod runner;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use meterbill_billing::{BillingEngine, EngineConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr, stdout carries the fees
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("meterbill worker v{}", env!("CARGO_PKG_VERSION"));

    let snapshot_path: PathBuf = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BILLING_SNAPSHOT_PATH").ok())
        .context("Pass a snapshot path or set BILLING_SNAPSHOT_PATH")?
        .into();
    let reference_instant = reference_instant()?;
    let config = EngineConfig::from_env()?;

    let store = Arc::new(runner::load_snapshot(&snapshot_path)?);
    info!(
        path = %snapshot_path.display(),
        subscriptions = store.subscriptions.len(),
        plans = store.plans.len(),
        timezone = %config.default_timezone,
        "Loaded snapshot"
    );

    let engine = Arc::new(BillingEngine::new(
        store.clone(),
        store.clone(),
        store,
        config,
    ));
    let report = runner::run_billing(engine, reference_instant).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for billed in &report.billed {
        serde_json::to_writer(&mut out, billed)?;
        writeln!(out)?;
    }
    out.flush()?;

    if !report.failed.is_empty() {
        anyhow::bail!("{} subscription(s) failed to bill", report.failed.len());
    }
    Ok(())
}

fn reference_instant() -> anyhow::Result<DateTime<Utc>> {
    match std::env::var("BILLING_REFERENCE_INSTANT") {
        Ok(raw) => Ok(DateTime::parse_from_rfc3339(raw.trim())
            .with_context(|| format!("BILLING_REFERENCE_INSTANT is not RFC 3339: {}", raw))?
            .with_timezone(&Utc)),
        Err(_) => {
            let now = Utc::now();
            info!(reference_instant = %now, "BILLING_REFERENCE_INSTANT not set, billing at current time");
            Ok(now)
        }
    }
}
