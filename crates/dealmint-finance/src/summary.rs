use std::sync::Arc;

use chrono::{DateTime, Utc};
use dealmint_core::policy::round_money;
use dealmint_core::{Balance, ClickStore, ConversionState, ConversionStore, LedgerError};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::maturation::MaturationScheduler;

#[derive(Debug, Clone, Serialize)]
pub struct AffiliateSummary {
    pub affiliate_id: Uuid,
    pub balance: Balance,
    pub click_count: u64,
    pub conversion_count: u64,
    pub pending_conversions: u64,
    /// Conversions per hundred clicks.
    pub click_through_rate: Decimal,
    pub generated_at: DateTime<Utc>,
}

/// Read model for the affiliate dashboard. Counts are eventually consistent; the balance
/// is the ledger's own snapshot.
pub struct SummaryReader {
    scheduler: Arc<MaturationScheduler>,
    conversions: Arc<dyn ConversionStore>,
    clicks: Arc<dyn ClickStore>,
}

impl SummaryReader {
    pub fn new(
        scheduler: Arc<MaturationScheduler>,
        conversions: Arc<dyn ConversionStore>,
        clicks: Arc<dyn ClickStore>,
    ) -> Self {
        Self {
            scheduler,
            conversions,
            clicks,
        }
    }

    pub async fn summary(
        &self,
        affiliate_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AffiliateSummary, LedgerError> {
        let balance = self.scheduler.balance_at(affiliate_id, now).await?;
        let click_count = self.clicks.count_for_affiliate(affiliate_id).await?;
        let conversions = self.conversions.for_affiliate(affiliate_id).await?;

        let mut conversion_count = 0u64;
        let mut pending_conversions = 0u64;
        for conversion in &conversions {
            match conversion.state_at(now) {
                ConversionState::Reversed => {}
                ConversionState::Pending => {
                    conversion_count += 1;
                    pending_conversions += 1;
                }
                ConversionState::Available => conversion_count += 1,
            }
        }

        Ok(AffiliateSummary {
            affiliate_id,
            balance,
            click_count,
            conversion_count,
            pending_conversions,
            click_through_rate: click_through_rate(conversion_count, click_count),
            generated_at: now,
        })
    }
}

fn click_through_rate(conversions: u64, clicks: u64) -> Decimal {
    if clicks == 0 {
        return Decimal::ZERO;
    }
    round_money(Decimal::from(conversions) * Decimal::ONE_HUNDRED / Decimal::from(clicks))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::testkit::harness;
    use crate::{ConversionIntake, ConversionOutcome};

    #[test]
    fn rate_is_zero_without_clicks() {
        assert_eq!(click_through_rate(3, 0), Decimal::ZERO);
        assert_eq!(click_through_rate(1, 3), dec!(33.33));
        assert_eq!(click_through_rate(2, 8), dec!(25.00));
    }

    #[tokio::test]
    async fn summary_counts_clicks_conversions_and_matures_lazily() {
        let h = harness(Some(dec!(0.10)), None).await;
        let t0 = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();

        let mut tokens = Vec::new();
        for visitor in ["v1", "v2", "v3", "v4"] {
            let click = h
                .attribution
                .record_click(h.link_id, visitor, t0)
                .await
                .unwrap();
            tokens.push(click.token);
        }
        let outcome = h
            .calculator
            .record_conversion(
                Some(&tokens[0]),
                ConversionIntake {
                    idempotency_key: "order-s1".to_string(),
                    coupon_id: None,
                    order_value: Some(dec!(50)),
                    user_id: None,
                    visitor_id: None,
                },
                t0,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, ConversionOutcome::Attributed { .. }));

        let reader = SummaryReader::new(
            h.scheduler.clone(),
            h.conversions.clone(),
            h.clicks.clone(),
        );
        let summary = reader
            .summary(h.affiliate_id, t0 + Duration::days(31))
            .await
            .unwrap();

        assert_eq!(summary.click_count, 4);
        assert_eq!(summary.conversion_count, 1);
        assert_eq!(summary.pending_conversions, 0);
        assert_eq!(summary.click_through_rate, dec!(25.00));
        assert_eq!(summary.balance.available, dec!(5.00));
    }
}
