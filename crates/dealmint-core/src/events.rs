use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::Balance;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryKind {
    CreditPending,
    Mature,
    DebitPayout,
    Adjust,
    Reverse,
}

impl LedgerEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreditPending => "CREDIT_PENDING",
            Self::Mature => "MATURE",
            Self::DebitPayout => "DEBIT_PAYOUT",
            Self::Adjust => "ADJUST",
            Self::Reverse => "REVERSE",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceBucket {
    Pending,
    Available,
}

/// Which lifetime total absorbs an adjustment so the balance still sums up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustCounterpart {
    LifetimeEarned,
    LifetimePaid,
}

/// A balance-affecting instruction. Amounts are positive except for `Adjust`, which is
/// signed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Posting {
    CreditPending {
        conversion_id: Uuid,
        amount: Decimal,
    },
    Mature {
        conversion_id: Uuid,
        amount: Decimal,
    },
    DebitPayout {
        payout_id: Uuid,
        amount: Decimal,
    },
    Adjust {
        bucket: BalanceBucket,
        counterpart: AdjustCounterpart,
        amount: Decimal,
        payout_id: Option<Uuid>,
    },
    Reverse {
        conversion_id: Uuid,
        amount: Decimal,
    },
}

/// Facts about an affiliate's earlier entries that some postings depend on. Stores fill
/// this in under the same lock they apply the posting with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostingContext {
    pub conversion_matured: bool,
    pub conversion_reversed: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceDelta {
    pub pending: Decimal,
    pub available: Decimal,
    pub lifetime_earned: Decimal,
    pub lifetime_paid: Decimal,
}

impl BalanceDelta {
    pub fn is_balanced(&self) -> bool {
        self.pending + self.available + self.lifetime_paid == self.lifetime_earned
    }
}

impl Posting {
    pub fn kind(&self) -> LedgerEntryKind {
        match self {
            Self::CreditPending { .. } => LedgerEntryKind::CreditPending,
            Self::Mature { .. } => LedgerEntryKind::Mature,
            Self::DebitPayout { .. } => LedgerEntryKind::DebitPayout,
            Self::Adjust { .. } => LedgerEntryKind::Adjust,
            Self::Reverse { .. } => LedgerEntryKind::Reverse,
        }
    }

    pub fn amount(&self) -> Decimal {
        match self {
            Self::CreditPending { amount, .. }
            | Self::Mature { amount, .. }
            | Self::DebitPayout { amount, .. }
            | Self::Adjust { amount, .. }
            | Self::Reverse { amount, .. } => *amount,
        }
    }

    pub fn conversion_id(&self) -> Option<Uuid> {
        match self {
            Self::CreditPending { conversion_id, .. }
            | Self::Mature { conversion_id, .. }
            | Self::Reverse { conversion_id, .. } => Some(*conversion_id),
            _ => None,
        }
    }

    pub fn payout_id(&self) -> Option<Uuid> {
        match self {
            Self::DebitPayout { payout_id, .. } => Some(*payout_id),
            Self::Adjust { payout_id, .. } => *payout_id,
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        let amount = self.amount();
        match self {
            Self::Adjust { .. } if amount.is_zero() => Err(LedgerError::InvalidAmount(
                "adjustment amount must be non-zero".to_string(),
            )),
            Self::Adjust { .. } => Ok(()),
            _ if amount <= Decimal::ZERO => Err(LedgerError::InvalidAmount(format!(
                "{} amount must be positive, got {amount}",
                self.kind().as_str()
            ))),
            _ => Ok(()),
        }
    }

    /// The balance movement this posting causes. Every delta keeps
    /// `pending + available + paid == earned`.
    pub fn delta(&self, context: PostingContext) -> Result<BalanceDelta, LedgerError> {
        self.validate()?;

        let delta = match self {
            Self::CreditPending { amount, .. } => BalanceDelta {
                pending: *amount,
                lifetime_earned: *amount,
                ..BalanceDelta::default()
            },
            Self::Mature { conversion_id, amount } => {
                if context.conversion_reversed {
                    return Err(LedgerError::AlreadyReversed(*conversion_id));
                }
                BalanceDelta {
                    pending: -*amount,
                    available: *amount,
                    ..BalanceDelta::default()
                }
            }
            Self::DebitPayout { amount, .. } => BalanceDelta {
                available: -*amount,
                lifetime_paid: *amount,
                ..BalanceDelta::default()
            },
            Self::Adjust {
                bucket,
                counterpart,
                amount,
                ..
            } => {
                let mut delta = BalanceDelta::default();
                match bucket {
                    BalanceBucket::Pending => delta.pending = *amount,
                    BalanceBucket::Available => delta.available = *amount,
                }
                match counterpart {
                    AdjustCounterpart::LifetimeEarned => delta.lifetime_earned = *amount,
                    AdjustCounterpart::LifetimePaid => delta.lifetime_paid = -*amount,
                }
                delta
            }
            Self::Reverse { amount, .. } => {
                let mut delta = BalanceDelta {
                    lifetime_earned: -*amount,
                    ..BalanceDelta::default()
                };
                if context.conversion_matured {
                    delta.available = -*amount;
                } else {
                    delta.pending = -*amount;
                }
                delta
            }
        };

        debug_assert!(delta.is_balanced());
        Ok(delta)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    pub affiliate_id: Uuid,
    pub entry_key: String,
    pub posting: Posting,
    pub actor: String,
    pub memo: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub affiliate_id: Uuid,
    pub sequence: i64,
    pub entry_key: String,
    pub posting: Posting,
    pub delta: BalanceDelta,
    pub actor: String,
    pub memo: Option<String>,
    pub balance_after: Balance,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn kind(&self) -> LedgerEntryKind {
        self.posting.kind()
    }
}

#[derive(Debug, Clone)]
pub struct AppliedEntry {
    pub entry: LedgerEntry,
    pub balance: Balance,
    /// False when the entry key had already been applied and this call was a replay.
    pub fresh: bool,
}

pub mod entry_keys {
    use uuid::Uuid;

    pub fn conversion_credit(conversion_id: Uuid) -> String {
        format!("conversion:{conversion_id}")
    }

    pub fn maturation(conversion_id: Uuid) -> String {
        format!("mature:{conversion_id}")
    }

    pub fn reversal(conversion_id: Uuid) -> String {
        format!("reverse:{conversion_id}")
    }

    pub fn payout_debit(payout_id: Uuid) -> String {
        format!("payout:{payout_id}")
    }

    pub fn payout_revert(payout_id: Uuid) -> String {
        format!("payout-revert:{payout_id}")
    }
}

/// Folds entries in sequence order into the balance they imply.
pub fn replay(affiliate_id: Uuid, entries: &[LedgerEntry]) -> Result<Balance, LedgerError> {
    entries
        .iter()
        .try_fold(Balance::empty(affiliate_id), |balance, entry| {
            balance.apply(&entry.delta)
        })
}
