pub mod error;
pub mod events;
pub mod models;
pub mod policy;
pub mod storage;

pub use error::{AttributionError, LedgerError};
pub use events::{
    AdjustCounterpart, AppliedEntry, BalanceBucket, BalanceDelta, LedgerEntry, LedgerEntryKind,
    NewLedgerEntry, Posting, PostingContext, entry_keys, replay,
};
pub use models::{
    Affiliate, AffiliateLink, AffiliateStatus, Balance, ClickEvent, Conversion, ConversionRecord,
    ConversionState, PaymentMethod, PayoutRequest, PayoutState, PayoutTransition,
    UnattributedConversion,
};
pub use policy::ProgramPolicy;
pub use storage::{AffiliateRegistry, ClickStore, ConversionStore, LedgerStore, PayoutStore};
