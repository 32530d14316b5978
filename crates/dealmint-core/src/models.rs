use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::events::BalanceDelta;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AffiliateStatus {
    Active,
    Suspended,
}

impl AffiliateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
        }
    }
}

impl FromStr for AffiliateStatus {
    type Err = LedgerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "SUSPENDED" => Ok(Self::Suspended),
            other => Err(LedgerError::InvalidRequest(format!(
                "unknown affiliate status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Affiliate {
    pub id: Uuid,
    pub code: String,
    pub display_name: String,
    pub default_commission_rate: Option<Decimal>,
    pub status: AffiliateStatus,
    pub created_at: DateTime<Utc>,
}

impl Affiliate {
    pub fn is_active(&self) -> bool {
        self.status == AffiliateStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffiliateLink {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub coupon_id: Option<Uuid>,
    pub tracking_code: String,
    pub commission_rate_override: Option<Decimal>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickEvent {
    pub id: Uuid,
    pub link_id: Uuid,
    pub affiliate_id: Uuid,
    pub token_id: Uuid,
    pub visitor_hash: String,
    pub clicked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversionState {
    Pending,
    Available,
    Reversed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversion {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub link_id: Uuid,
    pub token_id: Uuid,
    pub coupon_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub order_value: Option<Decimal>,
    pub commission_rate: Decimal,
    pub commission_amount: Decimal,
    pub idempotency_key: String,
    pub matures_at: DateTime<Utc>,
    /// Set once the MATURE ledger entry has been posted. Bookkeeping for the sweep only;
    /// `state_at` never reads it.
    pub matured_at: Option<DateTime<Utc>>,
    pub reversed_at: Option<DateTime<Utc>>,
    pub reversal_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Conversion {
    pub fn state_at(&self, now: DateTime<Utc>) -> ConversionState {
        if self.reversed_at.is_some() {
            ConversionState::Reversed
        } else if now >= self.matures_at {
            ConversionState::Available
        } else {
            ConversionState::Pending
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.matured_at.is_none() && self.state_at(now) == ConversionState::Available
    }
}

/// A purchase event that could not be tied to an affiliate. Kept under its idempotency
/// key so a retry of the same event gets the same answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnattributedConversion {
    pub id: Uuid,
    pub idempotency_key: String,
    pub reason_code: String,
    pub coupon_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub order_value: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

/// Whatever is stored under a conversion idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionRecord {
    Attributed(Conversion),
    Unattributed(UnattributedConversion),
}

impl ConversionRecord {
    pub fn idempotency_key(&self) -> &str {
        match self {
            Self::Attributed(conversion) => &conversion.idempotency_key,
            Self::Unattributed(record) => &record.idempotency_key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Balance {
    pub affiliate_id: Uuid,
    pub pending: Decimal,
    pub available: Decimal,
    pub lifetime_earned: Decimal,
    pub lifetime_paid: Decimal,
    pub version: i64,
}

impl Balance {
    pub fn empty(affiliate_id: Uuid) -> Self {
        Self {
            affiliate_id,
            pending: Decimal::ZERO,
            available: Decimal::ZERO,
            lifetime_earned: Decimal::ZERO,
            lifetime_paid: Decimal::ZERO,
            version: 0,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.pending + self.available + self.lifetime_paid == self.lifetime_earned
            && self.pending >= Decimal::ZERO
            && self.available >= Decimal::ZERO
    }

    /// Returns the balance after `delta`, refusing any result with a negative bucket.
    pub fn apply(&self, delta: &BalanceDelta) -> Result<Self, LedgerError> {
        let add = |current: Decimal, change: Decimal| {
            current.checked_add(change).ok_or_else(|| {
                LedgerError::InvalidAmount("balance total out of range".to_string())
            })
        };
        let next = Self {
            affiliate_id: self.affiliate_id,
            pending: add(self.pending, delta.pending)?,
            available: add(self.available, delta.available)?,
            lifetime_earned: add(self.lifetime_earned, delta.lifetime_earned)?,
            lifetime_paid: add(self.lifetime_paid, delta.lifetime_paid)?,
            version: self.version + 1,
        };

        if next.available < Decimal::ZERO {
            return Err(LedgerError::InsufficientBalance {
                requested: -delta.available,
                available: self.available,
            });
        }
        if next.pending < Decimal::ZERO {
            return Err(LedgerError::InsufficientBalance {
                requested: -delta.pending,
                available: self.pending,
            });
        }
        if next.lifetime_paid < Decimal::ZERO || next.lifetime_earned < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(
                "adjustment would drive a lifetime total negative".to_string(),
            ));
        }

        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Paypal,
    BankTransfer,
    GiftCard,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paypal => "PAYPAL",
            Self::BankTransfer => "BANK_TRANSFER",
            Self::GiftCard => "GIFT_CARD",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = LedgerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PAYPAL" => Ok(Self::Paypal),
            "BANK_TRANSFER" => Ok(Self::BankTransfer),
            "GIFT_CARD" => Ok(Self::GiftCard),
            other => Err(LedgerError::InvalidRequest(format!(
                "unsupported payment_method: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutState {
    Pending,
    Approved,
    Completed,
    Rejected,
}

impl PayoutState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Completed => "COMPLETED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }
}

impl fmt::Display for PayoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutState {
    type Err = LedgerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "COMPLETED" => Ok(Self::Completed),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(LedgerError::InvalidRequest(format!(
                "unsupported payout state: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayoutRequest {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub destination: String,
    pub state: PayoutState,
    pub requested_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
    pub rejection_reason: Option<String>,
    /// Set on a REJECTED request once any debit for it is known to be reverted.
    #[serde(default)]
    pub funds_released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutTransition {
    Approve {
        by: String,
        at: DateTime<Utc>,
    },
    Complete {
        transaction_id: String,
        at: DateTime<Utc>,
    },
    Reject {
        by: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl PayoutTransition {
    pub fn target(&self) -> PayoutState {
        match self {
            Self::Approve { .. } => PayoutState::Approved,
            Self::Complete { .. } => PayoutState::Completed,
            Self::Reject { .. } => PayoutState::Rejected,
        }
    }

    pub fn required_state(&self) -> PayoutState {
        match self {
            Self::Approve { .. } | Self::Reject { .. } => PayoutState::Pending,
            Self::Complete { .. } => PayoutState::Approved,
        }
    }

    /// Rejection is also allowed from APPROVED; everything else needs `required_state`.
    pub fn allowed_from(&self, current: PayoutState) -> bool {
        match self {
            Self::Approve { .. } => current == PayoutState::Pending,
            Self::Complete { .. } => current == PayoutState::Approved,
            Self::Reject { .. } => !current.is_terminal(),
        }
    }
}

impl PayoutRequest {
    /// Applies `transition` if the request is still in `expected`. Stores call this under
    /// their own lock or row lock so the check and the write are one step.
    pub fn transition(
        &self,
        expected: PayoutState,
        transition: &PayoutTransition,
    ) -> Result<Self, LedgerError> {
        if self.state != expected {
            return Err(LedgerError::InvalidTransition {
                expected,
                actual: self.state,
            });
        }
        if !transition.allowed_from(self.state) {
            return Err(LedgerError::InvalidTransition {
                expected: transition.required_state(),
                actual: self.state,
            });
        }

        let mut next = self.clone();
        next.state = transition.target();
        match transition {
            PayoutTransition::Approve { by, at } => {
                next.decided_by = Some(by.clone());
                next.decided_at = Some(*at);
            }
            PayoutTransition::Complete { transaction_id, at } => {
                next.transaction_id = Some(transaction_id.clone());
                next.completed_at = Some(*at);
            }
            PayoutTransition::Reject { by, reason, at } => {
                next.decided_by = Some(by.clone());
                next.decided_at = Some(*at);
                next.rejection_reason = Some(reason.clone());
            }
        }

        Ok(next)
    }
}
