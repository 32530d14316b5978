use std::sync::Arc;

use chrono::{DateTime, Utc};
use dealmint_core::{Balance, ConversionStore, LedgerError};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::BalanceLedger;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub matured: usize,
    pub skipped: usize,
}

/// Promotes conversions whose holding period has elapsed. Each promotion is an
/// idempotent MATURE entry keyed by conversion, so overlapping or restarted sweeps
/// cannot promote twice.
pub struct MaturationScheduler {
    conversions: Arc<dyn ConversionStore>,
    ledger: Arc<BalanceLedger>,
    batch_size: usize,
}

impl MaturationScheduler {
    pub fn new(
        conversions: Arc<dyn ConversionStore>,
        ledger: Arc<BalanceLedger>,
        batch_size: usize,
    ) -> Self {
        Self {
            conversions,
            ledger,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, LedgerError> {
        self.sweep_scope(None, now).await
    }

    pub async fn sweep_affiliate(
        &self,
        affiliate_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, LedgerError> {
        self.sweep_scope(Some(affiliate_id), now).await
    }

    /// Lazy maturation: promotes anything due for this affiliate, then reads.
    pub async fn balance_at(
        &self,
        affiliate_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Balance, LedgerError> {
        self.sweep_affiliate(affiliate_id, now).await?;
        self.ledger.get_balance(affiliate_id).await
    }

    async fn sweep_scope(
        &self,
        affiliate_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, LedgerError> {
        let mut report = SweepReport::default();

        loop {
            let batch = self
                .conversions
                .due_for_maturation(now, affiliate_id, self.batch_size)
                .await?;
            let batch_len = batch.len();
            let matured_before = report.matured;

            for conversion in batch {
                report.scanned += 1;
                match self.ledger.mature(&conversion, now).await {
                    Ok(_) => {
                        self.conversions.mark_matured(conversion.id, now).await?;
                        report.matured += 1;
                    }
                    Err(LedgerError::AlreadyReversed(_)) => {
                        report.skipped += 1;
                    }
                    Err(err @ LedgerError::Storage(_)) => return Err(err),
                    Err(err) => {
                        warn!(conversion_id = %conversion.id, "maturation skipped: {err}");
                        report.skipped += 1;
                    }
                }
            }

            if batch_len < self.batch_size || report.matured == matured_before {
                break;
            }
        }

        if report.matured > 0 {
            info!(
                scanned = report.scanned,
                matured = report.matured,
                skipped = report.skipped,
                "maturation sweep finished"
            );
        }
        Ok(report)
    }
}
