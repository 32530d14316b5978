use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use dealmint_attribution::{AttributionService, TokenSigner};
use dealmint_core::{
    Affiliate, AffiliateLink, AffiliateStatus, LedgerEntryKind, LedgerError, PaymentMethod,
    PayoutState, ProgramPolicy,
};
use dealmint_eventstore::{
    InMemoryAffiliateRegistry, InMemoryClickStore, InMemoryConversionStore, InMemoryLedgerStore,
    InMemoryPayoutStore,
};
use dealmint_finance::{
    BalanceLedger, CommissionCalculator, ConversionIntake, ConversionOutcome, MaturationScheduler,
};
use dealmint_payouts::{PayoutInput, PayoutService, RecordedTransfer};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

struct Program {
    attribution: Arc<AttributionService>,
    calculator: CommissionCalculator,
    ledger: Arc<BalanceLedger>,
    scheduler: Arc<MaturationScheduler>,
    payouts: Arc<PayoutService>,
    affiliate_id: Uuid,
    link_id: Uuid,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

async fn program() -> Program {
    let policy = ProgramPolicy::default();
    let registry = Arc::new(InMemoryAffiliateRegistry::default());
    let clicks = Arc::new(InMemoryClickStore::default());
    let conversions = Arc::new(InMemoryConversionStore::default());
    let ledger = Arc::new(BalanceLedger::new(Arc::new(InMemoryLedgerStore::new())));

    let affiliate_id = Uuid::new_v4();
    let link_id = Uuid::new_v4();
    registry
        .upsert_affiliate(Affiliate {
            id: affiliate_id,
            code: "COUPONQUEEN".to_string(),
            display_name: "Coupon Queen".to_string(),
            default_commission_rate: Some(dec!(0.10)),
            status: AffiliateStatus::Active,
            created_at: t0(),
        })
        .await;
    registry
        .upsert_link(AffiliateLink {
            id: link_id,
            affiliate_id,
            coupon_id: None,
            tracking_code: "cq-spring".to_string(),
            commission_rate_override: None,
            active: true,
            created_at: t0(),
        })
        .await;

    let attribution = Arc::new(AttributionService::new(
        registry.clone(),
        clicks,
        TokenSigner::new("integration-secret-abcdefghijklmnopqrstuvwxyz").unwrap(),
        policy.attribution_window,
    ));
    let calculator = CommissionCalculator::new(
        attribution.clone(),
        conversions.clone(),
        ledger.clone(),
        policy.clone(),
    );
    let scheduler = Arc::new(MaturationScheduler::new(conversions, ledger.clone(), 25));
    let payouts = Arc::new(PayoutService::new(
        Arc::new(InMemoryPayoutStore::default()),
        registry,
        ledger.clone(),
        scheduler.clone(),
        policy,
    ));

    Program {
        attribution,
        calculator,
        ledger,
        scheduler,
        payouts,
        affiliate_id,
        link_id,
    }
}

async fn earn(program: &Program, order: &str, value: Decimal, at: DateTime<Utc>) -> Uuid {
    let click = program
        .attribution
        .record_click(program.link_id, order, at)
        .await
        .unwrap();
    let outcome = program
        .calculator
        .record_conversion(
            Some(&click.token),
            ConversionIntake {
                idempotency_key: order.to_string(),
                coupon_id: None,
                order_value: Some(value),
                user_id: None,
                visitor_id: None,
            },
            at,
        )
        .await
        .unwrap();
    match outcome {
        ConversionOutcome::Attributed { conversion, .. } => conversion.id,
        ConversionOutcome::Unattributed { record, .. } => {
            panic!("unattributed: {}", record.reason_code)
        }
    }
}

fn paypal(amount: Decimal) -> PayoutInput {
    PayoutInput {
        amount,
        payment_method: PaymentMethod::Paypal,
        destination: "queen@example.com".to_string(),
    }
}

#[tokio::test]
async fn click_to_completed_payout() {
    let p = program().await;
    earn(&p, "order-1", dec!(100), t0()).await;
    earn(&p, "order-2", dec!(200), t0()).await;

    let pending = p.ledger.get_balance(p.affiliate_id).await.unwrap();
    assert_eq!(pending.pending, dec!(30.00));
    assert_eq!(pending.available, Decimal::ZERO);

    let matured_at = t0() + Duration::days(30);
    let report = p.scheduler.sweep(matured_at).await.unwrap();
    assert_eq!(report.matured, 2);

    let request = p
        .payouts
        .request(p.affiliate_id, paypal(dec!(30)), matured_at)
        .await
        .unwrap();
    let completed = p
        .payouts
        .approve(request.id, "finance-ops", &RecordedTransfer::new("PP-7781"), matured_at)
        .await
        .unwrap();
    assert_eq!(completed.state, PayoutState::Completed);
    assert_eq!(completed.transaction_id.as_deref(), Some("PP-7781"));

    let balance = p.ledger.verify(p.affiliate_id).await.unwrap();
    assert_eq!(balance.available, Decimal::ZERO);
    assert_eq!(balance.pending, Decimal::ZERO);
    assert_eq!(balance.lifetime_earned, dec!(30.00));
    assert_eq!(balance.lifetime_paid, dec!(30.00));

    let kinds: Vec<LedgerEntryKind> = p
        .ledger
        .entries(p.affiliate_id)
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![
            LedgerEntryKind::CreditPending,
            LedgerEntryKind::CreditPending,
            LedgerEntryKind::Mature,
            LedgerEntryKind::Mature,
            LedgerEntryKind::DebitPayout,
        ]
    );
}

#[tokio::test]
async fn request_limits_follow_the_available_balance() {
    let p = program().await;
    earn(&p, "order-1", dec!(300), t0()).await;
    let now = t0() + Duration::days(31);

    let small = p
        .payouts
        .request(p.affiliate_id, paypal(dec!(5)), now)
        .await
        .unwrap_err();
    assert_eq!(
        small,
        LedgerError::MinimumPayoutNotMet {
            requested: dec!(5),
            minimum: dec!(10.00),
        }
    );

    let large = p
        .payouts
        .request(p.affiliate_id, paypal(dec!(50)), now)
        .await
        .unwrap_err();
    assert_eq!(
        large,
        LedgerError::InsufficientBalance {
            requested: dec!(50),
            available: dec!(30.00),
        }
    );
}

#[tokio::test]
async fn unmatured_commission_cannot_be_paid() {
    let p = program().await;
    earn(&p, "order-1", dec!(300), t0()).await;

    let err = p
        .payouts
        .request(p.affiliate_id, paypal(dec!(20)), t0() + Duration::days(29))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_never_overdraw() {
    let p = program().await;
    earn(&p, "order-1", dec!(250), t0()).await;
    let now = t0() + Duration::days(30);

    let first = p
        .payouts
        .request(p.affiliate_id, paypal(dec!(20)), now)
        .await
        .unwrap();
    let second = p
        .payouts
        .request(p.affiliate_id, paypal(dec!(20)), now)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for (payout_id, reference) in [(first.id, "TX-A"), (second.id, "TX-B")] {
        let payouts = p.payouts.clone();
        handles.push(tokio::spawn(async move {
            payouts
                .approve(payout_id, "ops", &RecordedTransfer::new(reference), now)
                .await
        }));
    }

    let mut completed = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(request) => {
                assert_eq!(request.state, PayoutState::Completed);
                completed += 1;
            }
            Err(LedgerError::InsufficientBalance { .. }) => refused += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((completed, refused), (1, 1));

    let balance = p.ledger.verify(p.affiliate_id).await.unwrap();
    assert_eq!(balance.available, dec!(5.00));
    assert_eq!(balance.lifetime_paid, dec!(20));

    let rejected = p
        .payouts
        .list_by_state(PayoutState::Rejected, 10)
        .await
        .unwrap();
    assert_eq!(rejected.len(), 1);
}

#[tokio::test]
async fn failed_transfer_restores_funds_once() {
    let p = program().await;
    earn(&p, "order-1", dec!(400), t0()).await;
    let now = t0() + Duration::days(30);

    let request = p
        .payouts
        .request(p.affiliate_id, paypal(dec!(40)), now)
        .await
        .unwrap();
    // Blank reference: the transfer fails and the request is rejected with funds restored.
    let err = p
        .payouts
        .approve(request.id, "ops", &RecordedTransfer::new(""), now)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::PaymentFailed { .. }));

    let swept = p
        .payouts
        .reconcile(50, now + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(swept, 0);
    let balance = p.ledger.verify(p.affiliate_id).await.unwrap();
    assert_eq!(balance.available, dec!(40.00));
    assert_eq!(balance.lifetime_paid, Decimal::ZERO);

    let history = p.payouts.list_for_affiliate(p.affiliate_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, PayoutState::Rejected);
}

#[tokio::test]
async fn refunded_order_never_matures() {
    let p = program().await;
    let conversion_id = earn(&p, "order-1", dec!(100), t0()).await;
    earn(&p, "order-2", dec!(100), t0()).await;

    p.calculator
        .reverse_conversion(conversion_id, "customer refund", "support", t0() + Duration::days(3))
        .await
        .unwrap();
    p.scheduler.sweep(t0() + Duration::days(40)).await.unwrap();

    let balance = p.ledger.verify(p.affiliate_id).await.unwrap();
    assert_eq!(balance.pending, Decimal::ZERO);
    assert_eq!(balance.available, dec!(10.00));
    assert_eq!(balance.lifetime_earned, dec!(10.00));
}

#[tokio::test]
async fn paid_commission_cannot_be_reversed() {
    let p = program().await;
    let conversion_id = earn(&p, "order-1", dec!(200), t0()).await;
    let now = t0() + Duration::days(30);

    let request = p
        .payouts
        .request(p.affiliate_id, paypal(dec!(20)), now)
        .await
        .unwrap();
    p.payouts
        .approve(request.id, "ops", &RecordedTransfer::new("TX-1"), now)
        .await
        .unwrap();

    let err = p
        .calculator
        .reverse_conversion(conversion_id, "late chargeback", "support", now)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
    assert!(p.ledger.verify(p.affiliate_id).await.unwrap().is_consistent());
}
