use std::sync::Arc;

use chrono::{DateTime, Utc};
use dealmint_core::{
    AdjustCounterpart, AppliedEntry, Balance, BalanceBucket, Conversion, LedgerEntry, LedgerError,
    LedgerStore, NewLedgerEntry, PayoutRequest, Posting, entry_keys, replay,
};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const SYSTEM_ACTOR: &str = "ledger-system";

/// Write and read façade over a [`LedgerStore`]. Every balance change in the service goes
/// through `apply_entry`.
pub struct BalanceLedger {
    store: Arc<dyn LedgerStore>,
}

impl BalanceLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn apply_entry(&self, entry: NewLedgerEntry) -> Result<AppliedEntry, LedgerError> {
        let affiliate_id = entry.affiliate_id;
        let kind = entry.posting.kind();
        let amount = entry.posting.amount();
        let entry_key = entry.entry_key.clone();

        match self.store.apply(entry).await {
            Ok(applied) if applied.fresh => {
                info!(
                    %affiliate_id,
                    kind = kind.as_str(),
                    %amount,
                    sequence = applied.entry.sequence,
                    actor = %applied.entry.actor,
                    "ledger entry applied"
                );
                Ok(applied)
            }
            Ok(applied) => {
                info!(%affiliate_id, entry_key = %entry_key, "ledger entry replayed");
                Ok(applied)
            }
            Err(err @ LedgerError::Storage(_)) => {
                error!(%affiliate_id, kind = kind.as_str(), "ledger write failed: {err}");
                Err(err)
            }
            Err(err) => {
                warn!(%affiliate_id, kind = kind.as_str(), %amount, "ledger entry refused: {err}");
                Err(err)
            }
        }
    }

    pub async fn credit_pending(
        &self,
        conversion: &Conversion,
        now: DateTime<Utc>,
    ) -> Result<AppliedEntry, LedgerError> {
        self.apply_entry(NewLedgerEntry {
            affiliate_id: conversion.affiliate_id,
            entry_key: entry_keys::conversion_credit(conversion.id),
            posting: Posting::CreditPending {
                conversion_id: conversion.id,
                amount: conversion.commission_amount,
            },
            actor: SYSTEM_ACTOR.to_string(),
            memo: Some(format!("commission for order {}", conversion.idempotency_key)),
            recorded_at: now,
        })
        .await
    }

    pub async fn mature(
        &self,
        conversion: &Conversion,
        now: DateTime<Utc>,
    ) -> Result<AppliedEntry, LedgerError> {
        self.apply_entry(NewLedgerEntry {
            affiliate_id: conversion.affiliate_id,
            entry_key: entry_keys::maturation(conversion.id),
            posting: Posting::Mature {
                conversion_id: conversion.id,
                amount: conversion.commission_amount,
            },
            actor: SYSTEM_ACTOR.to_string(),
            memo: None,
            recorded_at: now,
        })
        .await
    }

    pub async fn reverse(
        &self,
        conversion: &Conversion,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<AppliedEntry, LedgerError> {
        self.apply_entry(NewLedgerEntry {
            affiliate_id: conversion.affiliate_id,
            entry_key: entry_keys::reversal(conversion.id),
            posting: Posting::Reverse {
                conversion_id: conversion.id,
                amount: conversion.commission_amount,
            },
            actor: actor.to_string(),
            memo: Some(reason.to_string()),
            recorded_at: now,
        })
        .await
    }

    pub async fn debit_payout(
        &self,
        payout: &PayoutRequest,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<AppliedEntry, LedgerError> {
        self.apply_entry(NewLedgerEntry {
            affiliate_id: payout.affiliate_id,
            entry_key: entry_keys::payout_debit(payout.id),
            posting: Posting::DebitPayout {
                payout_id: payout.id,
                amount: payout.amount,
            },
            actor: actor.to_string(),
            memo: Some(format!("payout via {}", payout.payment_method.as_str())),
            recorded_at: now,
        })
        .await
    }

    /// Returns a debited payout to the available bucket.
    pub async fn revert_payout(
        &self,
        payout: &PayoutRequest,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<AppliedEntry, LedgerError> {
        self.apply_entry(NewLedgerEntry {
            affiliate_id: payout.affiliate_id,
            entry_key: entry_keys::payout_revert(payout.id),
            posting: Posting::Adjust {
                bucket: BalanceBucket::Available,
                counterpart: AdjustCounterpart::LifetimePaid,
                amount: payout.amount,
                payout_id: Some(payout.id),
            },
            actor: actor.to_string(),
            memo: Some(reason.to_string()),
            recorded_at: now,
        })
        .await
    }

    /// Operator correction. The caller's `entry_key` makes retries safe.
    #[allow(clippy::too_many_arguments)]
    pub async fn adjust(
        &self,
        affiliate_id: Uuid,
        entry_key: &str,
        bucket: BalanceBucket,
        amount: Decimal,
        actor: &str,
        memo: &str,
        now: DateTime<Utc>,
    ) -> Result<AppliedEntry, LedgerError> {
        if memo.trim().is_empty() {
            return Err(LedgerError::InvalidRequest(
                "adjustments need a memo".to_string(),
            ));
        }

        self.apply_entry(NewLedgerEntry {
            affiliate_id,
            entry_key: format!("adjust:{}", entry_key.trim()),
            posting: Posting::Adjust {
                bucket,
                counterpart: AdjustCounterpart::LifetimeEarned,
                amount,
                payout_id: None,
            },
            actor: actor.trim().to_string(),
            memo: Some(memo.trim().to_string()),
            recorded_at: now,
        })
        .await
    }

    pub async fn get_balance(&self, affiliate_id: Uuid) -> Result<Balance, LedgerError> {
        self.store.balance(affiliate_id).await
    }

    pub async fn entries(&self, affiliate_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store.entries(affiliate_id).await
    }

    pub async fn has_entry(
        &self,
        affiliate_id: Uuid,
        entry_key: &str,
    ) -> Result<bool, LedgerError> {
        Ok(self.store.entry(affiliate_id, entry_key).await?.is_some())
    }

    /// Re-folds the entry log and checks it against the cached balance.
    pub async fn verify(&self, affiliate_id: Uuid) -> Result<Balance, LedgerError> {
        let entries = self.store.entries(affiliate_id).await?;
        let cached = self.store.balance(affiliate_id).await?;
        let folded = replay(affiliate_id, &entries)?;

        if folded.pending != cached.pending
            || folded.available != cached.available
            || folded.lifetime_earned != cached.lifetime_earned
            || folded.lifetime_paid != cached.lifetime_paid
            || !cached.is_consistent()
        {
            error!(%affiliate_id, ?cached, ?folded, "balance cache diverged from ledger");
            return Err(LedgerError::Storage(format!(
                "balance for affiliate {affiliate_id} diverged from its ledger"
            )));
        }

        Ok(cached)
    }
}
