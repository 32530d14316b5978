use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealmint_core::{
    ClickEvent, ClickStore, Conversion, ConversionRecord, ConversionStore, LedgerError,
    PayoutRequest, PayoutState, PayoutStore, PayoutTransition, UnattributedConversion,
};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct ClickLog {
    clicks: Vec<ClickEvent>,
    counted_tokens: HashSet<Uuid>,
    latest_by_visitor: HashMap<String, String>,
}

#[derive(Default)]
pub struct InMemoryClickStore {
    inner: RwLock<ClickLog>,
}

#[async_trait]
impl ClickStore for InMemoryClickStore {
    async fn record(&self, click: ClickEvent) -> Result<bool, LedgerError> {
        let mut log = self.inner.write().await;
        if !log.counted_tokens.insert(click.token_id) {
            return Ok(false);
        }
        log.clicks.push(click);
        Ok(true)
    }

    async fn remember_token(&self, visitor_hash: &str, token: &str) -> Result<(), LedgerError> {
        let mut log = self.inner.write().await;
        log.latest_by_visitor
            .insert(visitor_hash.to_string(), token.to_string());
        Ok(())
    }

    async fn latest_token(&self, visitor_hash: &str) -> Result<Option<String>, LedgerError> {
        let log = self.inner.read().await;
        Ok(log.latest_by_visitor.get(visitor_hash).cloned())
    }

    async fn count_for_affiliate(&self, affiliate_id: Uuid) -> Result<u64, LedgerError> {
        let log = self.inner.read().await;
        Ok(log
            .clicks
            .iter()
            .filter(|click| click.affiliate_id == affiliate_id)
            .count() as u64)
    }
}

#[derive(Default)]
struct ConversionTable {
    rows: HashMap<Uuid, Conversion>,
    unattributed: HashMap<Uuid, UnattributedConversion>,
    by_key: HashMap<String, Uuid>,
}

impl ConversionTable {
    fn record_for(&self, key: &str) -> Option<ConversionRecord> {
        let id = self.by_key.get(key)?;
        match self.rows.get(id) {
            Some(conversion) => Some(ConversionRecord::Attributed(conversion.clone())),
            None => self
                .unattributed
                .get(id)
                .cloned()
                .map(ConversionRecord::Unattributed),
        }
    }
}

#[derive(Default)]
pub struct InMemoryConversionStore {
    inner: RwLock<ConversionTable>,
}

#[async_trait]
impl ConversionStore for InMemoryConversionStore {
    async fn insert_if_absent(
        &self,
        record: ConversionRecord,
    ) -> Result<(ConversionRecord, bool), LedgerError> {
        let mut table = self.inner.write().await;
        if let Some(existing) = table.record_for(record.idempotency_key()) {
            return Ok((existing, false));
        }

        match &record {
            ConversionRecord::Attributed(conversion) => {
                table
                    .by_key
                    .insert(conversion.idempotency_key.clone(), conversion.id);
                table.rows.insert(conversion.id, conversion.clone());
            }
            ConversionRecord::Unattributed(unattributed) => {
                table
                    .by_key
                    .insert(unattributed.idempotency_key.clone(), unattributed.id);
                table
                    .unattributed
                    .insert(unattributed.id, unattributed.clone());
            }
        }
        Ok((record, true))
    }

    async fn get(&self, conversion_id: Uuid) -> Result<Option<Conversion>, LedgerError> {
        Ok(self.inner.read().await.rows.get(&conversion_id).cloned())
    }

    async fn by_idempotency_key(&self, key: &str) -> Result<Option<ConversionRecord>, LedgerError> {
        Ok(self.inner.read().await.record_for(key))
    }

    async fn due_for_maturation(
        &self,
        now: DateTime<Utc>,
        affiliate_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Conversion>, LedgerError> {
        let table = self.inner.read().await;
        let mut due: Vec<Conversion> = table
            .rows
            .values()
            .filter(|conversion| conversion.is_due(now))
            .filter(|conversion| affiliate_id.is_none_or(|id| conversion.affiliate_id == id))
            .cloned()
            .collect();
        due.sort_by_key(|conversion| conversion.matures_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_matured(
        &self,
        conversion_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut table = self.inner.write().await;
        let conversion = table
            .rows
            .get_mut(&conversion_id)
            .ok_or_else(|| LedgerError::not_found("conversion", conversion_id))?;
        conversion.matured_at.get_or_insert(at);
        Ok(())
    }

    async fn mark_reversed(
        &self,
        conversion_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Conversion, LedgerError> {
        let mut table = self.inner.write().await;
        let conversion = table
            .rows
            .get_mut(&conversion_id)
            .ok_or_else(|| LedgerError::not_found("conversion", conversion_id))?;
        if conversion.reversed_at.is_none() {
            conversion.reversed_at = Some(at);
            conversion.reversal_reason = Some(reason.to_string());
        }
        Ok(conversion.clone())
    }

    async fn for_affiliate(&self, affiliate_id: Uuid) -> Result<Vec<Conversion>, LedgerError> {
        let table = self.inner.read().await;
        let mut rows: Vec<Conversion> = table
            .rows
            .values()
            .filter(|conversion| conversion.affiliate_id == affiliate_id)
            .cloned()
            .collect();
        rows.sort_by_key(|conversion| conversion.created_at);
        Ok(rows)
    }
}

#[derive(Default)]
pub struct InMemoryPayoutStore {
    requests: RwLock<HashMap<Uuid, PayoutRequest>>,
}

#[async_trait]
impl PayoutStore for InMemoryPayoutStore {
    async fn insert(&self, request: PayoutRequest) -> Result<PayoutRequest, LedgerError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id) {
            return Err(LedgerError::InvalidRequest(format!(
                "payout request {} already exists",
                request.id
            )));
        }
        requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get(&self, payout_id: Uuid) -> Result<Option<PayoutRequest>, LedgerError> {
        Ok(self.requests.read().await.get(&payout_id).cloned())
    }

    async fn transition(
        &self,
        payout_id: Uuid,
        expected: PayoutState,
        transition: PayoutTransition,
    ) -> Result<PayoutRequest, LedgerError> {
        let mut requests = self.requests.write().await;
        let current = requests
            .get_mut(&payout_id)
            .ok_or_else(|| LedgerError::not_found("payout request", payout_id))?;
        let next = current.transition(expected, &transition)?;
        *current = next.clone();
        Ok(next)
    }

    async fn for_affiliate(&self, affiliate_id: Uuid) -> Result<Vec<PayoutRequest>, LedgerError> {
        let requests = self.requests.read().await;
        let mut rows: Vec<PayoutRequest> = requests
            .values()
            .filter(|request| request.affiliate_id == affiliate_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        Ok(rows)
    }

    async fn by_state(
        &self,
        state: PayoutState,
        limit: usize,
    ) -> Result<Vec<PayoutRequest>, LedgerError> {
        let requests = self.requests.read().await;
        let mut rows: Vec<PayoutRequest> = requests
            .values()
            .filter(|request| request.state == state)
            .cloned()
            .collect();
        rows.sort_by_key(|request| request.requested_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn unreleased_rejections(
        &self,
        decided_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PayoutRequest>, LedgerError> {
        let requests = self.requests.read().await;
        let mut rows: Vec<PayoutRequest> = requests
            .values()
            .filter(|request| request.state == PayoutState::Rejected)
            .filter(|request| request.funds_released_at.is_none())
            .filter(|request| request.decided_at.is_some_and(|at| at < decided_before))
            .cloned()
            .collect();
        rows.sort_by_key(|request| (request.decided_at, request.requested_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_funds_released(
        &self,
        payout_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&payout_id)
            .ok_or_else(|| LedgerError::not_found("payout request", payout_id))?;
        if request.state != PayoutState::Rejected {
            return Err(LedgerError::InvalidTransition {
                expected: PayoutState::Rejected,
                actual: request.state,
            });
        }
        request.funds_released_at.get_or_insert(at);
        Ok(())
    }
}
