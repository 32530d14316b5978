mod ledger;
mod records;
mod registry;

pub use ledger::InMemoryLedgerStore;
pub use records::{InMemoryClickStore, InMemoryConversionStore, InMemoryPayoutStore};
pub use registry::InMemoryAffiliateRegistry;
