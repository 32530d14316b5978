mod machine;
mod processor;

pub use machine::{INSUFFICIENT_AT_APPROVAL, PayoutInput, PayoutService};
pub use processor::{PaymentFailure, PaymentProcessor, RecordedTransfer};
