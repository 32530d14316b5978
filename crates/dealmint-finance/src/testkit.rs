use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dealmint_attribution::{AttributionService, TokenSigner};
use dealmint_core::{
    Affiliate, AffiliateLink, AffiliateStatus, Conversion, PaymentMethod, PayoutRequest,
    PayoutState, ProgramPolicy,
};
use dealmint_eventstore::{
    InMemoryAffiliateRegistry, InMemoryClickStore, InMemoryConversionStore, InMemoryLedgerStore,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{BalanceLedger, CommissionCalculator, MaturationScheduler};

pub fn conversion_for(affiliate_id: Uuid, amount: Decimal, now: DateTime<Utc>) -> Conversion {
    Conversion {
        id: Uuid::new_v4(),
        affiliate_id,
        link_id: Uuid::new_v4(),
        token_id: Uuid::new_v4(),
        coupon_id: None,
        user_id: None,
        order_value: None,
        commission_rate: Decimal::ZERO,
        commission_amount: amount,
        idempotency_key: Uuid::new_v4().to_string(),
        matures_at: now,
        matured_at: None,
        reversed_at: None,
        reversal_reason: None,
        created_at: now,
    }
}

pub fn payout_for(affiliate_id: Uuid, amount: Decimal, state: PayoutState) -> PayoutRequest {
    PayoutRequest {
        id: Uuid::new_v4(),
        affiliate_id,
        amount,
        payment_method: PaymentMethod::Paypal,
        destination: "affiliate@example.com".to_string(),
        state,
        requested_at: Utc::now(),
        decided_at: None,
        decided_by: None,
        completed_at: None,
        transaction_id: None,
        rejection_reason: None,
        funds_released_at: None,
    }
}

pub struct Harness {
    pub registry: Arc<InMemoryAffiliateRegistry>,
    pub clicks: Arc<InMemoryClickStore>,
    pub conversions: Arc<InMemoryConversionStore>,
    pub ledger: Arc<BalanceLedger>,
    pub attribution: Arc<AttributionService>,
    pub calculator: CommissionCalculator,
    pub scheduler: Arc<MaturationScheduler>,
    pub affiliate_id: Uuid,
    pub link_id: Uuid,
}

pub async fn harness(affiliate_rate: Option<Decimal>, link_rate: Option<Decimal>) -> Harness {
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
            code: "DEALHUNTER".to_string(),
            display_name: "Deal Hunter".to_string(),
            default_commission_rate: affiliate_rate,
            status: AffiliateStatus::Active,
            created_at: Utc::now(),
        })
        .await;
    registry
        .upsert_link(AffiliateLink {
            id: link_id,
            affiliate_id,
            coupon_id: None,
            tracking_code: "dealhunter-main".to_string(),
            commission_rate_override: link_rate,
            active: true,
            created_at: Utc::now(),
        })
        .await;

    let attribution = Arc::new(AttributionService::new(
        registry.clone(),
        clicks.clone(),
        TokenSigner::new("finance-test-secret-0123456789abcdef").unwrap(),
        Duration::days(30),
    ));
    let calculator = CommissionCalculator::new(
        attribution.clone(),
        conversions.clone(),
        ledger.clone(),
        policy,
    );
    let scheduler = Arc::new(MaturationScheduler::new(
        conversions.clone(),
        ledger.clone(),
        50,
    ));

    Harness {
        registry,
        clicks,
        conversions,
        ledger,
        attribution,
        calculator,
        scheduler,
        affiliate_id,
        link_id,
    }
}
