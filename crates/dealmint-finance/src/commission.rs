use std::sync::Arc;

use chrono::{DateTime, Utc};
use dealmint_attribution::AttributionService;
use dealmint_core::policy::{validate_money, validate_rate};
use dealmint_core::{
    AttributionError, Conversion, ConversionRecord, ConversionStore, LedgerError, ProgramPolicy,
    UnattributedConversion,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::BalanceLedger;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionIntake {
    pub idempotency_key: String,
    pub coupon_id: Option<Uuid>,
    pub order_value: Option<Decimal>,
    pub user_id: Option<Uuid>,
    /// Used to look up the last-click token when the caller has none.
    pub visitor_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ConversionOutcome {
    Attributed {
        conversion: Conversion,
        replayed: bool,
    },
    /// No affiliate earns anything. The record keeps the idempotency key so retries of the
    /// same purchase event stay unattributed.
    Unattributed {
        record: UnattributedConversion,
        replayed: bool,
    },
}

pub struct CommissionCalculator {
    attribution: Arc<AttributionService>,
    conversions: Arc<dyn ConversionStore>,
    ledger: Arc<BalanceLedger>,
    policy: ProgramPolicy,
}

impl CommissionCalculator {
    pub fn new(
        attribution: Arc<AttributionService>,
        conversions: Arc<dyn ConversionStore>,
        ledger: Arc<BalanceLedger>,
        policy: ProgramPolicy,
    ) -> Self {
        Self {
            attribution,
            conversions,
            ledger,
            policy,
        }
    }

    pub fn policy(&self) -> &ProgramPolicy {
        &self.policy
    }

    pub async fn record_conversion(
        &self,
        token: Option<&str>,
        intake: ConversionIntake,
        now: DateTime<Utc>,
    ) -> Result<ConversionOutcome, LedgerError> {
        let idempotency_key = intake.idempotency_key.trim().to_string();
        if idempotency_key.is_empty() {
            return Err(LedgerError::InvalidRequest(
                "idempotency_key is required".to_string(),
            ));
        }
        if let Some(order_value) = intake.order_value {
            validate_money(order_value, "order_value")?;
        }

        if let Some(existing) = self.conversions.by_idempotency_key(&idempotency_key).await? {
            return self.outcome(existing, true, now).await;
        }

        let token = match token.map(str::trim).filter(|raw| !raw.is_empty()) {
            Some(raw) => Some(raw.to_string()),
            None => match intake.visitor_id.as_deref() {
                Some(visitor_id) if !visitor_id.trim().is_empty() => {
                    self.attribution.latest_token_for_visitor(visitor_id).await?
                }
                _ => None,
            },
        };
        let resolved = match token {
            Some(token) => self.attribution.resolve(&token, now).await,
            None => Err(AttributionError::Missing),
        };

        let attribution = match resolved {
            Ok(attribution) => attribution,
            Err(AttributionError::Lookup(message)) => return Err(LedgerError::Storage(message)),
            Err(reason) => {
                warn!(
                    idempotency_key = %idempotency_key,
                    code = reason.code(),
                    "conversion recorded without attribution: {reason}"
                );
                let record = UnattributedConversion {
                    id: Uuid::new_v4(),
                    idempotency_key,
                    reason_code: reason.code().to_string(),
                    coupon_id: intake.coupon_id,
                    user_id: intake.user_id,
                    order_value: intake.order_value,
                    created_at: now,
                };
                let (stored, inserted) = self
                    .conversions
                    .insert_if_absent(ConversionRecord::Unattributed(record))
                    .await?;
                return self.outcome(stored, !inserted, now).await;
            }
        };

        let rate = attribution
            .link
            .commission_rate_override
            .or(attribution.affiliate.default_commission_rate)
            .unwrap_or(self.policy.default_commission_rate);
        validate_rate(rate)?;
        let commission_amount = self.policy.commission_for(intake.order_value, rate);

        let candidate = Conversion {
            id: Uuid::new_v4(),
            affiliate_id: attribution.affiliate.id,
            link_id: attribution.link.id,
            token_id: attribution.token.token_id,
            coupon_id: intake.coupon_id.or(attribution.link.coupon_id),
            user_id: intake.user_id,
            order_value: intake.order_value,
            commission_rate: rate,
            commission_amount,
            idempotency_key,
            matures_at: now + self.policy.holding_period,
            matured_at: None,
            reversed_at: None,
            reversal_reason: None,
            created_at: now,
        };

        let (stored, inserted) = self
            .conversions
            .insert_if_absent(ConversionRecord::Attributed(candidate))
            .await?;
        let outcome = self.outcome(stored, !inserted, now).await?;

        if let ConversionOutcome::Attributed {
            conversion,
            replayed: false,
        } = &outcome
        {
            info!(
                conversion_id = %conversion.id,
                affiliate_id = %conversion.affiliate_id,
                commission = %conversion.commission_amount,
                matures_at = %conversion.matures_at,
                "conversion attributed"
            );
        }
        Ok(outcome)
    }

    /// Voids the commission of a refunded order. Unmatured commission leaves the pending
    /// bucket; matured commission leaves the available bucket. Commission that has already
    /// been paid out cannot be clawed back here.
    pub async fn reverse_conversion(
        &self,
        conversion_id: Uuid,
        reason: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Conversion, LedgerError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LedgerError::InvalidRequest(
                "a reversal reason is required".to_string(),
            ));
        }
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(LedgerError::InvalidRequest(
                "reversed_by is required".to_string(),
            ));
        }

        let conversion = self
            .conversions
            .get(conversion_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("conversion", conversion_id))?;
        if conversion.reversed_at.is_some() {
            return Ok(conversion);
        }

        if conversion.commission_amount > Decimal::ZERO {
            self.ledger.reverse(&conversion, actor, reason, now).await?;
        }
        let reversed = self
            .conversions
            .mark_reversed(conversion_id, reason, now)
            .await?;
        info!(%conversion_id, affiliate_id = %reversed.affiliate_id, "conversion reversed");

        Ok(reversed)
    }

    /// Builds the answer for a stored record. Crediting is keyed by conversion, so a
    /// replay also completes a credit that an earlier call failed to post.
    async fn outcome(
        &self,
        record: ConversionRecord,
        replayed: bool,
        now: DateTime<Utc>,
    ) -> Result<ConversionOutcome, LedgerError> {
        match record {
            ConversionRecord::Attributed(conversion) => {
                if conversion.commission_amount > Decimal::ZERO {
                    self.ledger.credit_pending(&conversion, now).await?;
                }
                Ok(ConversionOutcome::Attributed {
                    conversion,
                    replayed,
                })
            }
            ConversionRecord::Unattributed(record) => {
                Ok(ConversionOutcome::Unattributed { record, replayed })
            }
        }
    }
}
