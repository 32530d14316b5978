use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealmint_core::{
    Affiliate, AffiliateLink, AffiliateRegistry, AppliedEntry, Balance, BalanceDelta, ClickEvent,
    ClickStore, Conversion, ConversionRecord, ConversionStore, LedgerEntry, LedgerError,
    LedgerStore, NewLedgerEntry, PayoutRequest, PayoutState, PayoutStore, PayoutTransition,
    Posting, PostingContext, UnattributedConversion, entry_keys,
};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const CONVERSION_COLUMNS: &str = "id, affiliate_id, link_id, token_id, coupon_id, user_id, \
    order_value, commission_rate, commission_amount, idempotency_key, matures_at, matured_at, \
    reversed_at, reversal_reason, unattributed_reason, created_at";

const INSERT_CONVERSION: &str = r#"
    INSERT INTO conversions (
        id, affiliate_id, link_id, token_id, coupon_id, user_id, order_value,
        commission_rate, commission_amount, idempotency_key, matures_at, unattributed_reason,
        created_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
    ON CONFLICT (idempotency_key) DO NOTHING
"#;

const ENTRY_COLUMNS: &str = "id, affiliate_id, sequence, entry_key, posting, delta, actor, memo, \
    balance_after, recorded_at";

const PAYOUT_COLUMNS: &str = "id, affiliate_id, amount, payment_method, destination, state, \
    requested_at, decided_at, decided_by, completed_at, transaction_id, rejection_reason, \
    funds_released_at";

fn db(err: sqlx::Error) -> LedgerError {
    LedgerError::storage(err)
}

fn decode(err: LedgerError) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

fn single_row(rows_affected: u64, what: &str) -> Result<(), LedgerError> {
    if rows_affected != 1 {
        return Err(LedgerError::storage(format!(
            "{what}: expected one row, touched {rows_affected}"
        )));
    }
    Ok(())
}

/// Postgres implementation of every storage trait. Balance writes lock the affiliate's
/// balance row for the length of one transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn affiliate_from_row(row: &PgRow) -> Result<Affiliate, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Affiliate {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        display_name: row.try_get("display_name")?,
        default_commission_rate: row.try_get("default_commission_rate")?,
        status: status.parse().map_err(decode)?,
        created_at: row.try_get("created_at")?,
    })
}

fn link_from_row(row: &PgRow) -> Result<AffiliateLink, sqlx::Error> {
    Ok(AffiliateLink {
        id: row.try_get("id")?,
        affiliate_id: row.try_get("affiliate_id")?,
        coupon_id: row.try_get("coupon_id")?,
        tracking_code: row.try_get("tracking_code")?,
        commission_rate_override: row.try_get("commission_rate_override")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn conversion_from_row(row: &PgRow) -> Result<Conversion, sqlx::Error> {
    Ok(Conversion {
        id: row.try_get("id")?,
        affiliate_id: row.try_get("affiliate_id")?,
        link_id: row.try_get("link_id")?,
        token_id: row.try_get("token_id")?,
        coupon_id: row.try_get("coupon_id")?,
        user_id: row.try_get("user_id")?,
        order_value: row.try_get("order_value")?,
        commission_rate: row.try_get("commission_rate")?,
        commission_amount: row.try_get("commission_amount")?,
        idempotency_key: row.try_get("idempotency_key")?,
        matures_at: row.try_get("matures_at")?,
        matured_at: row.try_get("matured_at")?,
        reversed_at: row.try_get("reversed_at")?,
        reversal_reason: row.try_get("reversal_reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<ConversionRecord, sqlx::Error> {
    let unattributed_reason: Option<String> = row.try_get("unattributed_reason")?;
    match unattributed_reason {
        Some(reason_code) => Ok(ConversionRecord::Unattributed(UnattributedConversion {
            id: row.try_get("id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            reason_code,
            coupon_id: row.try_get("coupon_id")?,
            user_id: row.try_get("user_id")?,
            order_value: row.try_get("order_value")?,
            created_at: row.try_get("created_at")?,
        })),
        None => conversion_from_row(row).map(ConversionRecord::Attributed),
    }
}

fn balance_from_row(row: &PgRow) -> Result<Balance, sqlx::Error> {
    Ok(Balance {
        affiliate_id: row.try_get("affiliate_id")?,
        pending: row.try_get("pending")?,
        available: row.try_get("available")?,
        lifetime_earned: row.try_get("lifetime_earned")?,
        lifetime_paid: row.try_get("lifetime_paid")?,
        version: row.try_get("version")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, sqlx::Error> {
    let posting: Json<Posting> = row.try_get("posting")?;
    let delta: Json<BalanceDelta> = row.try_get("delta")?;
    let balance_after: Json<Balance> = row.try_get("balance_after")?;
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        affiliate_id: row.try_get("affiliate_id")?,
        sequence: row.try_get("sequence")?,
        entry_key: row.try_get("entry_key")?,
        posting: posting.0,
        delta: delta.0,
        actor: row.try_get("actor")?,
        memo: row.try_get("memo")?,
        balance_after: balance_after.0,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn payout_from_row(row: &PgRow) -> Result<PayoutRequest, sqlx::Error> {
    let payment_method: String = row.try_get("payment_method")?;
    let state: String = row.try_get("state")?;
    Ok(PayoutRequest {
        id: row.try_get("id")?,
        affiliate_id: row.try_get("affiliate_id")?,
        amount: row.try_get("amount")?,
        payment_method: payment_method.parse().map_err(decode)?,
        destination: row.try_get("destination")?,
        state: state.parse().map_err(decode)?,
        requested_at: row.try_get("requested_at")?,
        decided_at: row.try_get("decided_at")?,
        decided_by: row.try_get("decided_by")?,
        completed_at: row.try_get("completed_at")?,
        transaction_id: row.try_get("transaction_id")?,
        rejection_reason: row.try_get("rejection_reason")?,
        funds_released_at: row.try_get("funds_released_at")?,
    })
}

#[async_trait]
impl AffiliateRegistry for PgStore {
    async fn affiliate(&self, affiliate_id: Uuid) -> Result<Option<Affiliate>, LedgerError> {
        let row = sqlx::query(
            "SELECT id, code, display_name, default_commission_rate, status, created_at FROM affiliates WHERE id = $1",
        )
        .bind(affiliate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        row.as_ref()
            .map(affiliate_from_row)
            .transpose()
            .map_err(db)
    }

    async fn link(&self, link_id: Uuid) -> Result<Option<AffiliateLink>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, affiliate_id, coupon_id, tracking_code, commission_rate_override, active, created_at
            FROM affiliate_links
            WHERE id = $1
            "#,
        )
        .bind(link_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        row.as_ref().map(link_from_row).transpose().map_err(db)
    }
}

#[async_trait]
impl ClickStore for PgStore {
    async fn record(&self, click: ClickEvent) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO click_events (id, link_id, affiliate_id, token_id, visitor_hash, clicked_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (token_id) DO NOTHING
            "#,
        )
        .bind(click.id)
        .bind(click.link_id)
        .bind(click.affiliate_id)
        .bind(click.token_id)
        .bind(&click.visitor_hash)
        .bind(click.clicked_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        Ok(result.rows_affected() == 1)
    }

    async fn remember_token(&self, visitor_hash: &str, token: &str) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO visitor_tokens (visitor_hash, token, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (visitor_hash) DO UPDATE SET token = EXCLUDED.token, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(visitor_hash)
        .bind(token)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn latest_token(&self, visitor_hash: &str) -> Result<Option<String>, LedgerError> {
        sqlx::query_scalar("SELECT token FROM visitor_tokens WHERE visitor_hash = $1")
            .bind(visitor_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)
    }

    async fn count_for_affiliate(&self, affiliate_id: Uuid) -> Result<u64, LedgerError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM click_events WHERE affiliate_id = $1")
                .bind(affiliate_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db)?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl ConversionStore for PgStore {
    async fn insert_if_absent(
        &self,
        record: ConversionRecord,
    ) -> Result<(ConversionRecord, bool), LedgerError> {
        let query = match &record {
            ConversionRecord::Attributed(conversion) => sqlx::query(INSERT_CONVERSION)
                .bind(conversion.id)
                .bind(Some(conversion.affiliate_id))
                .bind(Some(conversion.link_id))
                .bind(Some(conversion.token_id))
                .bind(conversion.coupon_id)
                .bind(conversion.user_id)
                .bind(conversion.order_value)
                .bind(conversion.commission_rate)
                .bind(conversion.commission_amount)
                .bind(&conversion.idempotency_key)
                .bind(conversion.matures_at)
                .bind(None::<String>)
                .bind(conversion.created_at),
            ConversionRecord::Unattributed(unattributed) => sqlx::query(INSERT_CONVERSION)
                .bind(unattributed.id)
                .bind(None::<Uuid>)
                .bind(None::<Uuid>)
                .bind(None::<Uuid>)
                .bind(unattributed.coupon_id)
                .bind(unattributed.user_id)
                .bind(unattributed.order_value)
                .bind(Decimal::ZERO)
                .bind(Decimal::ZERO)
                .bind(&unattributed.idempotency_key)
                .bind(unattributed.created_at)
                .bind(Some(&unattributed.reason_code))
                .bind(unattributed.created_at),
        };
        let result = query.execute(&self.pool).await.map_err(db)?;

        if result.rows_affected() == 1 {
            return Ok((record, true));
        }

        let existing = self
            .by_idempotency_key(record.idempotency_key())
            .await?
            .ok_or_else(|| {
                LedgerError::storage(format!(
                    "conversion {} vanished after a key conflict",
                    record.idempotency_key()
                ))
            })?;
        Ok((existing, false))
    }

    async fn get(&self, conversion_id: Uuid) -> Result<Option<Conversion>, LedgerError> {
        let sql = format!(
            "SELECT {CONVERSION_COLUMNS} FROM conversions WHERE id = $1 AND affiliate_id IS NOT NULL"
        );
        let row = sqlx::query(&sql)
            .bind(conversion_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(conversion_from_row).transpose().map_err(db)
    }

    async fn by_idempotency_key(&self, key: &str) -> Result<Option<ConversionRecord>, LedgerError> {
        let sql = format!("SELECT {CONVERSION_COLUMNS} FROM conversions WHERE idempotency_key = $1");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(record_from_row).transpose().map_err(db)
    }

    async fn due_for_maturation(
        &self,
        now: DateTime<Utc>,
        affiliate_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Conversion>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {CONVERSION_COLUMNS}
            FROM conversions
            WHERE matured_at IS NULL
              AND reversed_at IS NULL
              AND affiliate_id IS NOT NULL
              AND matures_at <= $1
              AND ($2::uuid IS NULL OR affiliate_id = $2)
            ORDER BY matures_at
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(affiliate_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(conversion_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)
    }

    async fn mark_matured(
        &self,
        conversion_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE conversions SET matured_at = COALESCE(matured_at, $2)
            WHERE id = $1 AND affiliate_id IS NOT NULL
            "#,
        )
        .bind(conversion_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("conversion", conversion_id));
        }
        Ok(())
    }

    async fn mark_reversed(
        &self,
        conversion_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Conversion, LedgerError> {
        let sql = format!(
            r#"
            UPDATE conversions
            SET reversed_at = COALESCE(reversed_at, $3),
                reversal_reason = COALESCE(reversal_reason, $2)
            WHERE id = $1 AND affiliate_id IS NOT NULL
            RETURNING {CONVERSION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(conversion_id)
            .bind(reason)
            .bind(at)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?
            .ok_or_else(|| LedgerError::not_found("conversion", conversion_id))?;
        conversion_from_row(&row).map_err(db)
    }

    async fn for_affiliate(&self, affiliate_id: Uuid) -> Result<Vec<Conversion>, LedgerError> {
        let sql = format!(
            "SELECT {CONVERSION_COLUMNS} FROM conversions WHERE affiliate_id = $1 ORDER BY created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(affiliate_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(conversion_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn apply(&self, entry: NewLedgerEntry) -> Result<AppliedEntry, LedgerError> {
        if entry.entry_key.trim().is_empty() {
            return Err(LedgerError::InvalidRequest(
                "entry_key is required".to_string(),
            ));
        }
        if entry.actor.trim().is_empty() {
            return Err(LedgerError::InvalidRequest("actor is required".to_string()));
        }

        let affiliate_id = entry.affiliate_id;
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query(
            "INSERT INTO affiliate_balances (affiliate_id) VALUES ($1) ON CONFLICT (affiliate_id) DO NOTHING",
        )
        .bind(affiliate_id)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let row = sqlx::query(
            r#"
            SELECT affiliate_id, pending, available, lifetime_earned, lifetime_paid, version
            FROM affiliate_balances
            WHERE affiliate_id = $1
            FOR UPDATE
            "#,
        )
        .bind(affiliate_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db)?;
        let balance = balance_from_row(&row).map_err(db)?;

        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE affiliate_id = $1 AND entry_key = $2"
        );
        let existing = sqlx::query(&sql)
            .bind(affiliate_id)
            .bind(&entry.entry_key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?;
        if let Some(row) = existing {
            let stored = entry_from_row(&row).map_err(db)?;
            tx.commit().await.map_err(db)?;
            return Ok(AppliedEntry {
                entry: stored,
                balance,
                fresh: false,
            });
        }

        let context = match entry.posting.conversion_id() {
            Some(conversion_id) => {
                let matured_key = entry_keys::maturation(conversion_id);
                let reversed_key = entry_keys::reversal(conversion_id);
                let present: Vec<String> = sqlx::query_scalar(
                    "SELECT entry_key FROM ledger_entries WHERE affiliate_id = $1 AND entry_key = ANY($2)",
                )
                .bind(affiliate_id)
                .bind(vec![matured_key.clone(), reversed_key.clone()])
                .fetch_all(&mut *tx)
                .await
                .map_err(db)?;
                PostingContext {
                    conversion_matured: present.contains(&matured_key),
                    conversion_reversed: present.contains(&reversed_key),
                }
            }
            None => PostingContext::default(),
        };

        let delta = entry.posting.delta(context)?;
        let next = balance.apply(&delta)?;
        let stored = LedgerEntry {
            id: Uuid::new_v4(),
            affiliate_id,
            sequence: next.version,
            entry_key: entry.entry_key,
            posting: entry.posting,
            delta,
            actor: entry.actor,
            memo: entry.memo,
            balance_after: next.clone(),
            recorded_at: entry.recorded_at,
        };

        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, affiliate_id, sequence, entry_key, kind, posting, delta, actor, memo,
                balance_after, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(stored.id)
        .bind(affiliate_id)
        .bind(stored.sequence)
        .bind(&stored.entry_key)
        .bind(stored.kind().as_str())
        .bind(Json(&stored.posting))
        .bind(Json(&stored.delta))
        .bind(&stored.actor)
        .bind(&stored.memo)
        .bind(Json(&stored.balance_after))
        .bind(stored.recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        let updated = sqlx::query(
            r#"
            UPDATE affiliate_balances
            SET pending = $2, available = $3, lifetime_earned = $4, lifetime_paid = $5,
                version = $6, updated_at = $7
            WHERE affiliate_id = $1 AND version = $8
            "#,
        )
        .bind(affiliate_id)
        .bind(next.pending)
        .bind(next.available)
        .bind(next.lifetime_earned)
        .bind(next.lifetime_paid)
        .bind(next.version)
        .bind(Utc::now())
        .bind(balance.version)
        .execute(&mut *tx)
        .await
        .map_err(db)?;
        single_row(updated.rows_affected(), "balance version moved under lock")?;

        tx.commit().await.map_err(db)?;

        Ok(AppliedEntry {
            entry: stored,
            balance: next,
            fresh: true,
        })
    }

    async fn balance(&self, affiliate_id: Uuid) -> Result<Balance, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT affiliate_id, pending, available, lifetime_earned, lifetime_paid, version
            FROM affiliate_balances
            WHERE affiliate_id = $1
            "#,
        )
        .bind(affiliate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;

        match row {
            Some(row) => balance_from_row(&row).map_err(db),
            None => Ok(Balance::empty(affiliate_id)),
        }
    }

    async fn entries(&self, affiliate_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE affiliate_id = $1 ORDER BY sequence"
        );
        let rows = sqlx::query(&sql)
            .bind(affiliate_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)
    }

    async fn entry(
        &self,
        affiliate_id: Uuid,
        entry_key: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE affiliate_id = $1 AND entry_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(affiliate_id)
            .bind(entry_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(entry_from_row).transpose().map_err(db)
    }
}

#[async_trait]
impl PayoutStore for PgStore {
    async fn insert(&self, request: PayoutRequest) -> Result<PayoutRequest, LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO payout_requests (
                id, affiliate_id, amount, payment_method, destination, state, requested_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(request.id)
        .bind(request.affiliate_id)
        .bind(request.amount)
        .bind(request.payment_method.as_str())
        .bind(&request.destination)
        .bind(request.state.as_str())
        .bind(request.requested_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;

        Ok(request)
    }

    async fn get(&self, payout_id: Uuid) -> Result<Option<PayoutRequest>, LedgerError> {
        let sql = format!("SELECT {PAYOUT_COLUMNS} FROM payout_requests WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(payout_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(payout_from_row).transpose().map_err(db)
    }

    async fn transition(
        &self,
        payout_id: Uuid,
        expected: PayoutState,
        transition: PayoutTransition,
    ) -> Result<PayoutRequest, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let sql = format!("SELECT {PAYOUT_COLUMNS} FROM payout_requests WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(payout_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db)?
            .ok_or_else(|| LedgerError::not_found("payout request", payout_id))?;
        let current = payout_from_row(&row).map_err(db)?;
        let next = current.transition(expected, &transition)?;

        sqlx::query(
            r#"
            UPDATE payout_requests
            SET state = $2, decided_at = $3, decided_by = $4, completed_at = $5,
                transaction_id = $6, rejection_reason = $7
            WHERE id = $1
            "#,
        )
        .bind(payout_id)
        .bind(next.state.as_str())
        .bind(next.decided_at)
        .bind(&next.decided_by)
        .bind(next.completed_at)
        .bind(&next.transaction_id)
        .bind(&next.rejection_reason)
        .execute(&mut *tx)
        .await
        .map_err(db)?;

        tx.commit().await.map_err(db)?;
        Ok(next)
    }

    async fn for_affiliate(&self, affiliate_id: Uuid) -> Result<Vec<PayoutRequest>, LedgerError> {
        let sql = format!(
            "SELECT {PAYOUT_COLUMNS} FROM payout_requests WHERE affiliate_id = $1 ORDER BY requested_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(affiliate_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(payout_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)
    }

    async fn by_state(
        &self,
        state: PayoutState,
        limit: usize,
    ) -> Result<Vec<PayoutRequest>, LedgerError> {
        let sql = format!(
            "SELECT {PAYOUT_COLUMNS} FROM payout_requests WHERE state = $1 ORDER BY requested_at LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(payout_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)
    }

    async fn unreleased_rejections(
        &self,
        decided_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PayoutRequest>, LedgerError> {
        let sql = format!(
            r#"
            SELECT {PAYOUT_COLUMNS}
            FROM payout_requests
            WHERE state = $1
              AND funds_released_at IS NULL
              AND decided_at < $2
            ORDER BY decided_at, requested_at
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(PayoutState::Rejected.as_str())
            .bind(decided_before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter()
            .map(payout_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(db)
    }

    async fn mark_funds_released(
        &self,
        payout_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE payout_requests
            SET funds_released_at = COALESCE(funds_released_at, $2)
            WHERE id = $1 AND state = $3
            "#,
        )
        .bind(payout_id)
        .bind(at)
        .bind(PayoutState::Rejected.as_str())
        .execute(&self.pool)
        .await
        .map_err(db)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match PayoutStore::get(self, payout_id).await? {
            Some(request) => Err(LedgerError::InvalidTransition {
                expected: PayoutState::Rejected,
                actual: request.state,
            }),
            None => Err(LedgerError::not_found("payout request", payout_id)),
        }
    }
}
