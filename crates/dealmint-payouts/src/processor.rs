use async_trait::async_trait;
use dealmint_core::PayoutRequest;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct PaymentFailure {
    pub reason: String,
}

impl PaymentFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Outbound seam to whatever actually moves the money. Returns the processor's
/// transaction reference on success.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn disburse(&self, payout: &PayoutRequest) -> Result<String, PaymentFailure>;
}

/// Operator already sent the funds by hand and supplies the reference at approval.
pub struct RecordedTransfer {
    transaction_id: String,
}

impl RecordedTransfer {
    pub fn new(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
        }
    }
}

#[async_trait]
impl PaymentProcessor for RecordedTransfer {
    async fn disburse(&self, _payout: &PayoutRequest) -> Result<String, PaymentFailure> {
        let reference = self.transaction_id.trim();
        if reference.is_empty() {
            return Err(PaymentFailure::new("no transaction reference supplied"));
        }
        Ok(reference.to_string())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use dealmint_core::{PaymentMethod, PayoutState};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use super::*;

    fn request() -> PayoutRequest {
        PayoutRequest {
            id: Uuid::new_v4(),
            affiliate_id: Uuid::new_v4(),
            amount: dec!(25),
            payment_method: PaymentMethod::BankTransfer,
            destination: "DE89370400440532013000".to_string(),
            state: PayoutState::Approved,
            requested_at: Utc::now(),
            decided_at: None,
            decided_by: None,
            completed_at: None,
            transaction_id: None,
            rejection_reason: None,
            funds_released_at: None,
        }
    }

    #[tokio::test]
    async fn recorded_transfer_echoes_reference() {
        let processor = RecordedTransfer::new(" TX-1001 ");
        assert_eq!(processor.disburse(&request()).await.unwrap(), "TX-1001");
    }

    #[tokio::test]
    async fn blank_reference_is_a_failure() {
        let processor = RecordedTransfer::new("  ");
        let failure = processor.disburse(&request()).await.unwrap_err();
        assert_eq!(failure.reason, "no transaction reference supplied");
    }
}
