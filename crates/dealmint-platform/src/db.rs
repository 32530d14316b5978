use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS affiliates (
    id UUID PRIMARY KEY,
    code TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    default_commission_rate NUMERIC(6, 4),
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS affiliate_links (
    id UUID PRIMARY KEY,
    affiliate_id UUID NOT NULL REFERENCES affiliates (id),
    coupon_id UUID,
    tracking_code TEXT NOT NULL UNIQUE,
    commission_rate_override NUMERIC(6, 4),
    active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS click_events (
    id UUID PRIMARY KEY,
    link_id UUID NOT NULL,
    affiliate_id UUID NOT NULL,
    token_id UUID NOT NULL UNIQUE,
    visitor_hash TEXT NOT NULL,
    clicked_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS click_events_affiliate_idx ON click_events (affiliate_id);

CREATE TABLE IF NOT EXISTS visitor_tokens (
    visitor_hash TEXT PRIMARY KEY,
    token TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS conversions (
    id UUID PRIMARY KEY,
    affiliate_id UUID,
    link_id UUID,
    token_id UUID,
    coupon_id UUID,
    user_id UUID,
    order_value NUMERIC(14, 2),
    commission_rate NUMERIC(6, 4) NOT NULL,
    commission_amount NUMERIC(14, 2) NOT NULL,
    idempotency_key TEXT NOT NULL UNIQUE,
    matures_at TIMESTAMPTZ NOT NULL,
    matured_at TIMESTAMPTZ,
    reversed_at TIMESTAMPTZ,
    reversal_reason TEXT,
    unattributed_reason TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    CHECK ((unattributed_reason IS NULL) = (affiliate_id IS NOT NULL))
);
CREATE INDEX IF NOT EXISTS conversions_due_idx
    ON conversions (matures_at)
    WHERE matured_at IS NULL AND reversed_at IS NULL AND affiliate_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS conversions_affiliate_idx ON conversions (affiliate_id);

CREATE TABLE IF NOT EXISTS affiliate_balances (
    affiliate_id UUID PRIMARY KEY,
    pending NUMERIC(14, 2) NOT NULL DEFAULT 0 CHECK (pending >= 0),
    available NUMERIC(14, 2) NOT NULL DEFAULT 0 CHECK (available >= 0),
    lifetime_earned NUMERIC(14, 2) NOT NULL DEFAULT 0,
    lifetime_paid NUMERIC(14, 2) NOT NULL DEFAULT 0,
    version BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id UUID PRIMARY KEY,
    affiliate_id UUID NOT NULL,
    sequence BIGINT NOT NULL,
    entry_key TEXT NOT NULL,
    kind TEXT NOT NULL,
    posting JSONB NOT NULL,
    delta JSONB NOT NULL,
    actor TEXT NOT NULL,
    memo TEXT,
    balance_after JSONB NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL,
    UNIQUE (affiliate_id, entry_key),
    UNIQUE (affiliate_id, sequence)
);

CREATE TABLE IF NOT EXISTS payout_requests (
    id UUID PRIMARY KEY,
    affiliate_id UUID NOT NULL,
    amount NUMERIC(14, 2) NOT NULL CHECK (amount > 0),
    payment_method TEXT NOT NULL,
    destination TEXT NOT NULL,
    state TEXT NOT NULL,
    requested_at TIMESTAMPTZ NOT NULL,
    decided_at TIMESTAMPTZ,
    decided_by TEXT,
    completed_at TIMESTAMPTZ,
    transaction_id TEXT,
    rejection_reason TEXT,
    funds_released_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS payout_requests_state_idx ON payout_requests (state, requested_at);
CREATE INDEX IF NOT EXISTS payout_requests_affiliate_idx ON payout_requests (affiliate_id);
CREATE INDEX IF NOT EXISTS payout_requests_unreleased_idx
    ON payout_requests (decided_at) WHERE state = 'REJECTED' AND funds_released_at IS NULL;
"#;

pub async fn connect_database(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Creates any missing tables and indexes. Safe to run on every start.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("failed to apply ledger schema")?;
    info!("ledger schema ready");
    Ok(())
}
