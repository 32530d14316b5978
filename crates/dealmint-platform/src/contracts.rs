use chrono::{DateTime, Utc};
use dealmint_core::{Balance, BalanceBucket, Conversion, LedgerEntry, PayoutRequest, PayoutState};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CONVERSIONS_CHANNEL: &str = "ledger.conversions";
pub const PAYOUTS_CHANNEL: &str = "ledger.payouts";
pub const MATURED_CHANNEL: &str = "ledger.matured";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordClickRequest {
    pub visitor_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordClickResponse {
    pub token: String,
    pub click_id: Uuid,
    pub link_id: Uuid,
    pub affiliate_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConversionRequest {
    pub idempotency_key: String,
    pub coupon_id: Option<Uuid>,
    pub order_value: Option<Decimal>,
    pub user_id: Option<Uuid>,
    pub attribution_token: Option<String>,
    pub visitor_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConversionResponse {
    pub attributed: bool,
    #[serde(default)]
    pub replayed: bool,
    pub conversion: Option<Conversion>,
    /// Machine code explaining why no affiliate was credited.
    pub unattributed_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseConversionRequest {
    pub reason: String,
    pub reversed_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerResponse {
    pub affiliate_id: Uuid,
    pub balance: Balance,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutQueueQuery {
    pub state: Option<String>,
    #[serde(default = "default_queue_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovePayoutRequest {
    pub approved_by: String,
    pub transaction_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectPayoutRequest {
    pub rejected_by: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentRequest {
    pub bucket: BalanceBucket,
    pub amount: Decimal,
    pub actor: String,
    pub memo: String,
    /// Caller-chosen reference; retries with the same reference post once.
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentResponse {
    pub entry: LedgerEntry,
    pub balance: Balance,
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub event: String,
    pub conversion_id: Uuid,
    pub affiliate_id: Uuid,
    pub commission_amount: Decimal,
    pub matures_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

impl ConversionEvent {
    pub fn recorded(conversion: &Conversion) -> Self {
        Self::from_conversion("CONVERSION_RECORDED", conversion, conversion.created_at)
    }

    pub fn reversed(conversion: &Conversion) -> Self {
        let at = conversion.reversed_at.unwrap_or(conversion.created_at);
        Self::from_conversion("CONVERSION_REVERSED", conversion, at)
    }

    fn from_conversion(event: &str, conversion: &Conversion, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event: event.to_string(),
            conversion_id: conversion.id,
            affiliate_id: conversion.affiliate_id,
            commission_amount: conversion.commission_amount,
            matures_at: conversion.matures_at,
            occurred_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutEvent {
    pub payout_id: Uuid,
    pub affiliate_id: Uuid,
    pub amount: Decimal,
    pub state: PayoutState,
    pub transaction_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl PayoutEvent {
    pub fn from_request(request: &PayoutRequest, occurred_at: DateTime<Utc>) -> Self {
        Self {
            payout_id: request.id,
            affiliate_id: request.affiliate_id,
            amount: request.amount,
            state: request.state,
            transaction_id: request.transaction_id.clone(),
            rejection_reason: request.rejection_reason.clone(),
            occurred_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaturationSweptEvent {
    pub scanned: usize,
    pub matured: usize,
    pub skipped: usize,
    pub payouts_repaired: usize,
    pub swept_at: DateTime<Utc>,
}

fn default_queue_limit() -> usize {
    100
}
