use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::models::PayoutState;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
    },
    #[error("minimum payout not met: requested {requested}, minimum {minimum}")]
    MinimumPayoutNotMet { requested: Decimal, minimum: Decimal },
    #[error("invalid transition: expected {expected}, found {actual}")]
    InvalidTransition {
        expected: PayoutState,
        actual: PayoutState,
    },
    #[error("conversion {0} has been reversed")]
    AlreadyReversed(Uuid),
    #[error("affiliate {0} is not active")]
    AffiliateInactive(Uuid),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("payment for payout {payout_id} failed: {reason}")]
    PaymentFailed { payout_id: Uuid, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Stable machine-readable code surfaced to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::MinimumPayoutNotMet { .. } => "MIN_PAYOUT_NOT_MET",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::AlreadyReversed(_) => "ALREADY_REVERSED",
            Self::AffiliateInactive(_) => "AFFILIATE_INACTIVE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidAmount(_) | Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::PaymentFailed { .. } => "PAYMENT_FAILED",
            Self::Storage(_) => "INTERNAL",
        }
    }
}

/// Reasons a conversion could not be credited to an affiliate. None of these fail the
/// purchase; the conversion is recorded as unattributed instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttributionError {
    #[error("attribution token is malformed or has been tampered with")]
    InvalidToken,
    #[error("attribution token expired {elapsed_secs}s after issue")]
    ExpiredAttribution { elapsed_secs: i64 },
    #[error("affiliate link {0} is unknown")]
    UnknownLink(Uuid),
    #[error("affiliate link {0} is no longer active")]
    LinkInactive(Uuid),
    #[error("no attribution token presented")]
    Missing,
    #[error("attribution lookup failed: {0}")]
    Lookup(String),
}

impl AttributionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "INVALID_TOKEN",
            Self::ExpiredAttribution { .. } => "EXPIRED_ATTRIBUTION",
            Self::UnknownLink(_) => "UNKNOWN_LINK",
            Self::LinkInactive(_) => "LINK_INACTIVE",
            Self::Missing => "NO_ATTRIBUTION",
            Self::Lookup(_) => "ATTRIBUTION_LOOKUP_FAILED",
        }
    }
}

impl From<AttributionError> for LedgerError {
    fn from(err: AttributionError) -> Self {
        match err {
            AttributionError::Lookup(message) => Self::Storage(message),
            other => Self::InvalidRequest(other.to_string()),
        }
    }
}
