use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dealmint_core::policy::validate_money;
use dealmint_core::{
    AffiliateRegistry, LedgerError, PaymentMethod, PayoutRequest, PayoutState, PayoutStore,
    PayoutTransition, ProgramPolicy, entry_keys,
};
use dealmint_finance::{BalanceLedger, MaturationScheduler};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::processor::PaymentProcessor;

pub const INSUFFICIENT_AT_APPROVAL: &str = "insufficient balance at approval time";

/// An approval that loaded a request just before it was rejected can still post its debit
/// for a short while. Reconcile only closes out rejections older than this.
const RELEASE_GRACE_MINUTES: i64 = 15;

#[derive(Debug, Clone, Deserialize)]
pub struct PayoutInput {
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub destination: String,
}

/// Drives payout requests through PENDING -> APPROVED -> COMPLETED, or to REJECTED.
/// Funds leave the available bucket only on approval; every path into REJECTED after
/// a debit puts them back.
pub struct PayoutService {
    payouts: Arc<dyn PayoutStore>,
    registry: Arc<dyn AffiliateRegistry>,
    ledger: Arc<BalanceLedger>,
    scheduler: Arc<MaturationScheduler>,
    policy: ProgramPolicy,
}

impl PayoutService {
    pub fn new(
        payouts: Arc<dyn PayoutStore>,
        registry: Arc<dyn AffiliateRegistry>,
        ledger: Arc<BalanceLedger>,
        scheduler: Arc<MaturationScheduler>,
        policy: ProgramPolicy,
    ) -> Self {
        Self {
            payouts,
            registry,
            ledger,
            scheduler,
            policy,
        }
    }

    /// Files a PENDING request. The balance check here is advisory; approval re-checks
    /// atomically against the ledger.
    pub async fn request(
        &self,
        affiliate_id: Uuid,
        input: PayoutInput,
        now: DateTime<Utc>,
    ) -> Result<PayoutRequest, LedgerError> {
        if input.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "payout amount must be positive, got {}",
                input.amount
            )));
        }
        validate_money(input.amount, "payout amount")?;
        if input.amount < self.policy.minimum_payout {
            return Err(LedgerError::MinimumPayoutNotMet {
                requested: input.amount,
                minimum: self.policy.minimum_payout,
            });
        }
        let destination = input.destination.trim();
        if destination.is_empty() {
            return Err(LedgerError::InvalidRequest(
                "payout destination is required".to_string(),
            ));
        }

        let affiliate = self
            .registry
            .affiliate(affiliate_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("affiliate", affiliate_id))?;
        if !affiliate.is_active() {
            return Err(LedgerError::AffiliateInactive(affiliate_id));
        }

        let balance = self.scheduler.balance_at(affiliate_id, now).await?;
        if input.amount > balance.available {
            return Err(LedgerError::InsufficientBalance {
                requested: input.amount,
                available: balance.available,
            });
        }

        let request = self
            .payouts
            .insert(PayoutRequest {
                id: Uuid::new_v4(),
                affiliate_id,
                amount: input.amount,
                payment_method: input.payment_method,
                destination: destination.to_string(),
                state: PayoutState::Pending,
                requested_at: now,
                decided_at: None,
                decided_by: None,
                completed_at: None,
                transaction_id: None,
                rejection_reason: None,
                funds_released_at: None,
            })
            .await?;

        info!(
            payout_id = %request.id,
            %affiliate_id,
            amount = %request.amount,
            method = request.payment_method.as_str(),
            "payout requested"
        );
        Ok(request)
    }

    /// Debits the ledger, moves the request to APPROVED and hands it to `processor`.
    /// Returns the COMPLETED request, or an error after the request has been rejected
    /// and any debit restored.
    pub async fn approve(
        &self,
        payout_id: Uuid,
        operator: &str,
        processor: &dyn PaymentProcessor,
        now: DateTime<Utc>,
    ) -> Result<PayoutRequest, LedgerError> {
        let operator = required(operator, "approving operator")?;
        let request = self.load(payout_id).await?;
        if request.state != PayoutState::Pending {
            return Err(LedgerError::InvalidTransition {
                expected: PayoutState::Pending,
                actual: request.state,
            });
        }

        self.scheduler
            .sweep_affiliate(request.affiliate_id, now)
            .await?;

        match self.ledger.debit_payout(&request, &operator, now).await {
            Ok(_) => {}
            Err(err @ LedgerError::InsufficientBalance { .. }) => {
                let rejected = self
                    .payouts
                    .transition(
                        payout_id,
                        PayoutState::Pending,
                        PayoutTransition::Reject {
                            by: operator.clone(),
                            reason: INSUFFICIENT_AT_APPROVAL.to_string(),
                            at: now,
                        },
                    )
                    .await;
                match rejected {
                    Ok(_) => warn!(%payout_id, "payout rejected at approval: {err}"),
                    Err(LedgerError::InvalidTransition { actual, .. }) => {
                        warn!(%payout_id, state = actual.as_str(), "payout moved during approval")
                    }
                    Err(other) => return Err(other),
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        let approved = match self
            .payouts
            .transition(
                payout_id,
                PayoutState::Pending,
                PayoutTransition::Approve {
                    by: operator.clone(),
                    at: now,
                },
            )
            .await
        {
            Ok(approved) => approved,
            Err(LedgerError::InvalidTransition { actual, .. }) => {
                if actual == PayoutState::Rejected {
                    self.settle_rejected(&request, &operator, now).await?;
                }
                return Err(LedgerError::InvalidTransition {
                    expected: PayoutState::Pending,
                    actual,
                });
            }
            Err(err) => return Err(err),
        };
        info!(%payout_id, operator = %operator, amount = %approved.amount, "payout approved");

        let failure = match processor.disburse(&approved).await {
            Ok(transaction_id) if !transaction_id.trim().is_empty() => {
                return self.complete(payout_id, &transaction_id, now).await;
            }
            Ok(_) => "processor returned an empty transaction id".to_string(),
            Err(failure) => failure.reason,
        };

        error!(%payout_id, "payment failed: {failure}");
        let reason = format!("payment failed: {failure}");
        let rejected = self
            .payouts
            .transition(
                payout_id,
                PayoutState::Approved,
                PayoutTransition::Reject {
                    by: operator.clone(),
                    reason: reason.clone(),
                    at: now,
                },
            )
            .await?;
        self.settle_rejected(&rejected, &operator, now).await?;

        Err(LedgerError::PaymentFailed {
            payout_id,
            reason: failure,
        })
    }

    /// Records the processor reference for an APPROVED request.
    pub async fn complete(
        &self,
        payout_id: Uuid,
        transaction_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PayoutRequest, LedgerError> {
        let transaction_id = required(transaction_id, "transaction_id")?;
        let completed = self
            .payouts
            .transition(
                payout_id,
                PayoutState::Approved,
                PayoutTransition::Complete {
                    transaction_id: transaction_id.clone(),
                    at: now,
                },
            )
            .await?;
        info!(%payout_id, transaction_id = %transaction_id, "payout completed");
        Ok(completed)
    }

    /// Rejects a PENDING or APPROVED request. Funds debited for it return to available.
    pub async fn reject(
        &self,
        payout_id: Uuid,
        operator: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PayoutRequest, LedgerError> {
        let operator = required(operator, "rejecting operator")?;
        let reason = required(reason, "rejection reason")?;
        let request = self.load(payout_id).await?;
        if request.state.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                expected: PayoutState::Pending,
                actual: request.state,
            });
        }

        let rejected = self
            .payouts
            .transition(
                payout_id,
                request.state,
                PayoutTransition::Reject {
                    by: operator.clone(),
                    reason,
                    at: now,
                },
            )
            .await?;
        self.settle_rejected(&rejected, &operator, now).await?;

        info!(%payout_id, operator = %operator, from = request.state.as_str(), "payout rejected");
        Ok(rejected)
    }

    /// Restores funds for REJECTED requests whose debit was never reverted, e.g. after a
    /// crash between the state change and the ledger write, then marks each examined
    /// request released so later passes move on to newer ones. Returns how many debits
    /// were reverted.
    pub async fn reconcile(&self, limit: usize, now: DateTime<Utc>) -> Result<usize, LedgerError> {
        let decided_before = now - Duration::minutes(RELEASE_GRACE_MINUTES);
        let rejected = self
            .payouts
            .unreleased_rejections(decided_before, limit)
            .await?;
        let mut repaired = 0;
        for request in &rejected {
            if self
                .settle_rejected(request, dealmint_finance::SYSTEM_ACTOR, now)
                .await?
            {
                repaired += 1;
            }
            self.payouts.mark_funds_released(request.id, now).await?;
        }
        if repaired > 0 {
            warn!(repaired, "restored funds for rejected payouts");
        }
        Ok(repaired)
    }

    pub async fn get(&self, payout_id: Uuid) -> Result<PayoutRequest, LedgerError> {
        self.load(payout_id).await
    }

    pub async fn list_for_affiliate(
        &self,
        affiliate_id: Uuid,
    ) -> Result<Vec<PayoutRequest>, LedgerError> {
        self.payouts.for_affiliate(affiliate_id).await
    }

    pub async fn list_by_state(
        &self,
        state: PayoutState,
        limit: usize,
    ) -> Result<Vec<PayoutRequest>, LedgerError> {
        self.payouts.by_state(state, limit).await
    }

    async fn load(&self, payout_id: Uuid) -> Result<PayoutRequest, LedgerError> {
        self.payouts
            .get(payout_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("payout request", payout_id))
    }

    /// Reverts the debit for a rejected request if one was posted and not yet reverted.
    async fn settle_rejected(
        &self,
        request: &PayoutRequest,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let affiliate_id = request.affiliate_id;
        let debit_key = entry_keys::payout_debit(request.id);
        if !self.ledger.has_entry(affiliate_id, &debit_key).await? {
            return Ok(false);
        }
        let revert_key = entry_keys::payout_revert(request.id);
        if self.ledger.has_entry(affiliate_id, &revert_key).await? {
            return Ok(false);
        }

        let reason = request
            .rejection_reason
            .as_deref()
            .unwrap_or("payout rejected");
        self.ledger
            .revert_payout(request, actor, reason, now)
            .await?;
        Ok(true)
    }
}

fn required(value: &str, field: &str) -> Result<String, LedgerError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LedgerError::InvalidRequest(format!("{field} is required")));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration;
    use dealmint_core::{Affiliate, AffiliateStatus, BalanceBucket};
    use dealmint_eventstore::{
        InMemoryAffiliateRegistry, InMemoryConversionStore, InMemoryLedgerStore,
        InMemoryPayoutStore,
    };
    use rust_decimal_macros::dec;

    use super::*;
    use crate::processor::{PaymentFailure, RecordedTransfer};

    struct Declining;

    #[async_trait]
    impl PaymentProcessor for Declining {
        async fn disburse(&self, _payout: &PayoutRequest) -> Result<String, PaymentFailure> {
            Err(PaymentFailure::new("account closed"))
        }
    }

    struct Fixture {
        service: PayoutService,
        payouts: Arc<InMemoryPayoutStore>,
        ledger: Arc<BalanceLedger>,
        registry: Arc<InMemoryAffiliateRegistry>,
        affiliate_id: Uuid,
    }

    async fn fixture(available: Decimal) -> Fixture {
        let registry = Arc::new(InMemoryAffiliateRegistry::default());
        let ledger = Arc::new(BalanceLedger::new(Arc::new(InMemoryLedgerStore::new())));
        let scheduler = Arc::new(MaturationScheduler::new(
            Arc::new(InMemoryConversionStore::default()),
            ledger.clone(),
            10,
        ));
        let affiliate_id = Uuid::new_v4();
        registry
            .upsert_affiliate(Affiliate {
                id: affiliate_id,
                code: "SAVER".to_string(),
                display_name: "Saver".to_string(),
                default_commission_rate: None,
                status: AffiliateStatus::Active,
                created_at: Utc::now(),
            })
            .await;
        if available > Decimal::ZERO {
            ledger
                .adjust(
                    affiliate_id,
                    "seed",
                    BalanceBucket::Available,
                    available,
                    "ops",
                    "opening balance",
                    Utc::now(),
                )
                .await
                .unwrap();
        }

        let payouts = Arc::new(InMemoryPayoutStore::default());
        let service = PayoutService::new(
            payouts.clone(),
            registry.clone(),
            ledger.clone(),
            scheduler,
            ProgramPolicy::default(),
        );
        Fixture {
            service,
            payouts,
            ledger,
            registry,
            affiliate_id,
        }
    }

    /// Debits and approves without calling a processor, leaving the request APPROVED.
    async fn approved(f: &Fixture, amount: Decimal, now: DateTime<Utc>) -> PayoutRequest {
        let request = f
            .service
            .request(f.affiliate_id, input(amount), now)
            .await
            .unwrap();
        f.ledger.debit_payout(&request, "ops", now).await.unwrap();
        f.payouts
            .transition(
                request.id,
                PayoutState::Pending,
                PayoutTransition::Approve {
                    by: "ops".to_string(),
                    at: now,
                },
            )
            .await
            .unwrap()
    }

    async fn reverts_for(f: &Fixture, payout_id: Uuid) -> usize {
        let revert_key = entry_keys::payout_revert(payout_id);
        f.ledger
            .entries(f.affiliate_id)
            .await
            .unwrap()
            .iter()
            .filter(|entry| entry.entry_key == revert_key)
            .count()
    }

    fn input(amount: Decimal) -> PayoutInput {
        PayoutInput {
            amount,
            payment_method: PaymentMethod::Paypal,
            destination: "saver@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn request_validates_amount_and_destination() {
        let f = fixture(dec!(30)).await;
        let now = Utc::now();

        let below = f.service.request(f.affiliate_id, input(dec!(5)), now).await;
        assert!(matches!(
            below,
            Err(LedgerError::MinimumPayoutNotMet { .. })
        ));

        let fractional = f
            .service
            .request(f.affiliate_id, input(dec!(12.345)), now)
            .await;
        assert!(matches!(fractional, Err(LedgerError::InvalidAmount(_))));

        let mut blank = input(dec!(20));
        blank.destination = "  ".to_string();
        let blank = f.service.request(f.affiliate_id, blank, now).await;
        assert!(matches!(blank, Err(LedgerError::InvalidRequest(_))));

        let too_much = f.service.request(f.affiliate_id, input(dec!(50)), now).await;
        assert!(matches!(
            too_much,
            Err(LedgerError::InsufficientBalance { .. })
        ));

        let ok = f
            .service
            .request(f.affiliate_id, input(dec!(10.00)), now)
            .await
            .unwrap();
        assert_eq!(ok.state, PayoutState::Pending);
        assert_eq!(
            f.ledger.get_balance(f.affiliate_id).await.unwrap().available,
            dec!(30)
        );
    }

    #[tokio::test]
    async fn suspended_affiliate_cannot_request() {
        let f = fixture(dec!(30)).await;
        f.registry
            .set_status(f.affiliate_id, AffiliateStatus::Suspended)
            .await
            .unwrap();
        let err = f
            .service
            .request(f.affiliate_id, input(dec!(20)), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::AffiliateInactive(f.affiliate_id));
    }

    #[tokio::test]
    async fn payment_failure_restores_available() {
        let f = fixture(dec!(30)).await;
        let now = Utc::now();
        let request = f
            .service
            .request(f.affiliate_id, input(dec!(30)), now)
            .await
            .unwrap();

        let err = f
            .service
            .approve(request.id, "ops", &Declining, now)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::PaymentFailed { .. }));

        let stored = f.service.get(request.id).await.unwrap();
        assert_eq!(stored.state, PayoutState::Rejected);
        assert_eq!(
            stored.rejection_reason.as_deref(),
            Some("payment failed: account closed")
        );

        let balance = f.ledger.verify(f.affiliate_id).await.unwrap();
        assert_eq!(balance.available, dec!(30));
        assert_eq!(balance.lifetime_paid, Decimal::ZERO);
    }

    #[tokio::test]
    async fn approval_rejects_when_funds_are_gone() {
        let f = fixture(dec!(30)).await;
        let now = Utc::now();
        let request = f
            .service
            .request(f.affiliate_id, input(dec!(25)), now)
            .await
            .unwrap();
        f.ledger
            .adjust(
                f.affiliate_id,
                "fraud-clawback",
                BalanceBucket::Available,
                dec!(-20),
                "risk",
                "chargeback",
                now,
            )
            .await
            .unwrap();

        let err = f
            .service
            .approve(request.id, "ops", &RecordedTransfer::new("TX-1"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));

        let stored = f.service.get(request.id).await.unwrap();
        assert_eq!(stored.state, PayoutState::Rejected);
        assert_eq!(
            stored.rejection_reason.as_deref(),
            Some(INSUFFICIENT_AT_APPROVAL)
        );
        assert_eq!(
            f.ledger.get_balance(f.affiliate_id).await.unwrap().available,
            dec!(10)
        );
    }

    #[tokio::test]
    async fn terminal_requests_cannot_move() {
        let f = fixture(dec!(40)).await;
        let now = Utc::now();
        let request = f
            .service
            .request(f.affiliate_id, input(dec!(20)), now)
            .await
            .unwrap();
        let completed = f
            .service
            .approve(request.id, "ops", &RecordedTransfer::new("TX-9"), now)
            .await
            .unwrap();
        assert_eq!(completed.state, PayoutState::Completed);
        assert_eq!(completed.transaction_id.as_deref(), Some("TX-9"));

        let again = f
            .service
            .approve(request.id, "ops", &RecordedTransfer::new("TX-9"), now)
            .await
            .unwrap_err();
        assert_eq!(
            again,
            LedgerError::InvalidTransition {
                expected: PayoutState::Pending,
                actual: PayoutState::Completed,
            }
        );
        let reject = f
            .service
            .reject(request.id, "ops", "changed mind", now)
            .await
            .unwrap_err();
        assert!(matches!(reject, LedgerError::InvalidTransition { .. }));

        let balance = f.ledger.verify(f.affiliate_id).await.unwrap();
        assert_eq!(balance.available, dec!(20));
        assert_eq!(balance.lifetime_paid, dec!(20));
    }

    #[tokio::test]
    async fn rejecting_pending_leaves_balance_alone() {
        let f = fixture(dec!(40)).await;
        let now = Utc::now();
        let request = f
            .service
            .request(f.affiliate_id, input(dec!(20)), now)
            .await
            .unwrap();
        let rejected = f
            .service
            .reject(request.id, "ops", "destination looks wrong", now + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(rejected.state, PayoutState::Rejected);
        assert_eq!(rejected.decided_by.as_deref(), Some("ops"));
        assert_eq!(
            f.ledger.get_balance(f.affiliate_id).await.unwrap().available,
            dec!(40)
        );
        assert_eq!(f.service.reconcile(10, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn amounts_beyond_a_money_column_are_invalid() {
        let f = fixture(dec!(30)).await;
        let err = f
            .service
            .request(f.affiliate_id, input(Decimal::MAX), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn rejecting_an_approved_request_returns_funds_once() {
        let f = fixture(dec!(40)).await;
        let now = Utc::now();
        let request = approved(&f, dec!(25), now).await;
        assert_eq!(request.state, PayoutState::Approved);
        assert_eq!(
            f.ledger.get_balance(f.affiliate_id).await.unwrap().available,
            dec!(15)
        );

        let rejected = f
            .service
            .reject(request.id, "ops", "affiliate closed the account", now)
            .await
            .unwrap();
        assert_eq!(rejected.state, PayoutState::Rejected);
        assert_eq!(
            rejected.rejection_reason.as_deref(),
            Some("affiliate closed the account")
        );

        let again = f
            .service
            .reject(request.id, "ops", "second click", now)
            .await
            .unwrap_err();
        assert!(matches!(again, LedgerError::InvalidTransition { .. }));
        assert_eq!(
            f.service
                .reconcile(10, now + Duration::hours(1))
                .await
                .unwrap(),
            0
        );

        assert_eq!(reverts_for(&f, request.id).await, 1);
        let balance = f.ledger.verify(f.affiliate_id).await.unwrap();
        assert_eq!(balance.available, dec!(40));
        assert_eq!(balance.lifetime_paid, Decimal::ZERO);
    }

    #[tokio::test]
    async fn complete_records_the_transfer_reference() {
        let f = fixture(dec!(40)).await;
        let now = Utc::now();
        let request = approved(&f, dec!(25), now).await;

        let blank = f.service.complete(request.id, "  ", now).await.unwrap_err();
        assert!(matches!(blank, LedgerError::InvalidRequest(_)));

        let completed = f
            .service
            .complete(request.id, " TX-77 ", now + Duration::minutes(3))
            .await
            .unwrap();
        assert_eq!(completed.state, PayoutState::Completed);
        assert_eq!(completed.transaction_id.as_deref(), Some("TX-77"));
        assert_eq!(completed.completed_at, Some(now + Duration::minutes(3)));

        let twice = f
            .service
            .complete(request.id, "TX-78", now)
            .await
            .unwrap_err();
        assert_eq!(
            twice,
            LedgerError::InvalidTransition {
                expected: PayoutState::Approved,
                actual: PayoutState::Completed,
            }
        );

        let balance = f.ledger.verify(f.affiliate_id).await.unwrap();
        assert_eq!(balance.available, dec!(15));
        assert_eq!(balance.lifetime_paid, dec!(25));
    }

    #[tokio::test]
    async fn completing_a_pending_request_is_refused() {
        let f = fixture(dec!(40)).await;
        let now = Utc::now();
        let request = f
            .service
            .request(f.affiliate_id, input(dec!(20)), now)
            .await
            .unwrap();
        let err = f
            .service
            .complete(request.id, "TX-1", now)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InvalidTransition {
                expected: PayoutState::Approved,
                actual: PayoutState::Pending,
            }
        );
    }

    #[tokio::test]
    async fn rejection_needs_a_reason() {
        let f = fixture(dec!(40)).await;
        let now = Utc::now();
        let request = f
            .service
            .request(f.affiliate_id, input(dec!(20)), now)
            .await
            .unwrap();

        let err = f
            .service
            .reject(request.id, "ops", "   ", now)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)));
        assert_eq!(
            f.service.get(request.id).await.unwrap().state,
            PayoutState::Pending
        );
    }

    #[tokio::test]
    async fn reconcile_reaches_debits_behind_older_rejections() {
        let f = fixture(dec!(100)).await;
        let now = Utc::now();

        let clean = f
            .service
            .request(f.affiliate_id, input(dec!(10)), now)
            .await
            .unwrap();
        f.service
            .reject(clean.id, "ops", "duplicate", now)
            .await
            .unwrap();

        // Debited and moved to REJECTED, but the revert never landed.
        let stranded = approved(&f, dec!(20), now).await;
        f.payouts
            .transition(
                stranded.id,
                PayoutState::Approved,
                PayoutTransition::Reject {
                    by: "ops".to_string(),
                    reason: "bank bounced the transfer".to_string(),
                    at: now + Duration::seconds(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            f.ledger.get_balance(f.affiliate_id).await.unwrap().available,
            dec!(80)
        );

        let too_soon = f.service.reconcile(1, now).await.unwrap();
        assert_eq!(too_soon, 0);

        let later = now + Duration::hours(1);
        let mut repaired = Vec::new();
        for _ in 0..3 {
            repaired.push(f.service.reconcile(1, later).await.unwrap());
        }
        assert_eq!(repaired, vec![0, 1, 0]);

        let balance = f.ledger.verify(f.affiliate_id).await.unwrap();
        assert_eq!(balance.available, dec!(100));
        assert_eq!(reverts_for(&f, stranded.id).await, 1);
        assert!(
            f.service
                .get(stranded.id)
                .await
                .unwrap()
                .funds_released_at
                .is_some()
        );
    }
}
