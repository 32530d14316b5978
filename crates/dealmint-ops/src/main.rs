use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use dealmint_finance::{BalanceLedger, MaturationScheduler};
use dealmint_payouts::PayoutService;
use dealmint_platform::{
    MATURED_CHANNEL, MaturationSweptEvent, PgStore, RedisBus, ServiceConfig, connect_database,
    ensure_schema,
};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

const SWEEP_BATCH_SIZE: usize = 500;
const RECONCILE_BATCH_SIZE: usize = 200;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "dealmint_ops=info,dealmint_finance=info".to_string()),
        )
        .init();

    let config = ServiceConfig::worker_from_env()?;
    let pool = connect_database(&config.database_url).await?;
    ensure_schema(&pool).await?;
    let redis = RedisBus::connect(&config.redis_url)?;

    let store = Arc::new(PgStore::new(pool));
    let ledger = Arc::new(BalanceLedger::new(store.clone()));
    let scheduler = Arc::new(MaturationScheduler::new(
        store.clone(),
        ledger.clone(),
        SWEEP_BATCH_SIZE,
    ));
    let payouts = PayoutService::new(
        store.clone(),
        store.clone(),
        ledger,
        scheduler.clone(),
        config.policy.clone(),
    );

    info!(
        interval_secs = config.maturation_interval.as_secs(),
        "maturation worker started"
    );

    let mut ticker = tokio::time::interval(config.maturation_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = run_cycle(&scheduler, &payouts, &redis).await {
            error!("maturation cycle failed: {err:#}");
        }
    }
}

async fn run_cycle(
    scheduler: &MaturationScheduler,
    payouts: &PayoutService,
    redis: &RedisBus,
) -> Result<()> {
    let now = Utc::now();
    let report = scheduler
        .sweep(now)
        .await
        .context("maturation sweep failed")?;
    let repaired = payouts
        .reconcile(RECONCILE_BATCH_SIZE, now)
        .await
        .context("payout reconciliation failed")?;

    if report.matured == 0 && repaired == 0 {
        return Ok(());
    }

    let event = MaturationSweptEvent {
        scanned: report.scanned,
        matured: report.matured,
        skipped: report.skipped,
        payouts_repaired: repaired,
        swept_at: now,
    };
    redis.publish_json(MATURED_CHANNEL, &event).await?;
    info!(
        matured = report.matured,
        repaired, "published maturation summary"
    );
    Ok(())
}
