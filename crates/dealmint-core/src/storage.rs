use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::events::{AppliedEntry, LedgerEntry, NewLedgerEntry};
use crate::models::{
    Affiliate, AffiliateLink, Balance, ClickEvent, Conversion, ConversionRecord, PayoutRequest,
    PayoutState, PayoutTransition,
};

/// Lookups into the affiliate directory, which is owned elsewhere.
#[async_trait]
pub trait AffiliateRegistry: Send + Sync {
    async fn affiliate(&self, affiliate_id: Uuid) -> Result<Option<Affiliate>, LedgerError>;
    async fn link(&self, link_id: Uuid) -> Result<Option<AffiliateLink>, LedgerError>;
}

#[async_trait]
pub trait ClickStore: Send + Sync {
    /// Returns false when a click for the same token was already counted.
    async fn record(&self, click: ClickEvent) -> Result<bool, LedgerError>;
    /// Last-click wins: replaces whatever token the visitor held before.
    async fn remember_token(&self, visitor_hash: &str, token: &str) -> Result<(), LedgerError>;
    async fn latest_token(&self, visitor_hash: &str) -> Result<Option<String>, LedgerError>;
    async fn count_for_affiliate(&self, affiliate_id: Uuid) -> Result<u64, LedgerError>;
}

#[async_trait]
pub trait ConversionStore: Send + Sync {
    /// Inserts unless a record with the same idempotency key exists, attributed or not, in
    /// which case the stored one is returned with `false`.
    async fn insert_if_absent(
        &self,
        record: ConversionRecord,
    ) -> Result<(ConversionRecord, bool), LedgerError>;
    /// Attributed conversions only.
    async fn get(&self, conversion_id: Uuid) -> Result<Option<Conversion>, LedgerError>;
    async fn by_idempotency_key(&self, key: &str) -> Result<Option<ConversionRecord>, LedgerError>;
    async fn due_for_maturation(
        &self,
        now: DateTime<Utc>,
        affiliate_id: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Conversion>, LedgerError>;
    async fn mark_matured(
        &self,
        conversion_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;
    async fn mark_reversed(
        &self,
        conversion_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Conversion, LedgerError>;
    async fn for_affiliate(&self, affiliate_id: Uuid) -> Result<Vec<Conversion>, LedgerError>;
}

/// The materialized balance and its entry log. `apply` is the only write path and must
/// validate, update the balance and append the entry as one atomic step per affiliate.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn apply(&self, entry: NewLedgerEntry) -> Result<AppliedEntry, LedgerError>;
    async fn balance(&self, affiliate_id: Uuid) -> Result<Balance, LedgerError>;
    async fn entries(&self, affiliate_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError>;
    async fn entry(
        &self,
        affiliate_id: Uuid,
        entry_key: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError>;
}

#[async_trait]
pub trait PayoutStore: Send + Sync {
    async fn insert(&self, request: PayoutRequest) -> Result<PayoutRequest, LedgerError>;
    async fn get(&self, payout_id: Uuid) -> Result<Option<PayoutRequest>, LedgerError>;
    /// Compare-and-set: applies `transition` only if the request is still in `expected`.
    async fn transition(
        &self,
        payout_id: Uuid,
        expected: PayoutState,
        transition: PayoutTransition,
    ) -> Result<PayoutRequest, LedgerError>;
    async fn for_affiliate(&self, affiliate_id: Uuid) -> Result<Vec<PayoutRequest>, LedgerError>;
    async fn by_state(
        &self,
        state: PayoutState,
        limit: usize,
    ) -> Result<Vec<PayoutRequest>, LedgerError>;
    /// REJECTED requests decided before `decided_before` and not yet marked with
    /// `funds_released_at`, oldest decision first.
    async fn unreleased_rejections(
        &self,
        decided_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PayoutRequest>, LedgerError>;
    async fn mark_funds_released(
        &self,
        payout_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;
}
