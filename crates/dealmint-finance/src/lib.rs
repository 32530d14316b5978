mod commission;
mod ledger;
mod maturation;
mod summary;

pub use commission::{CommissionCalculator, ConversionIntake, ConversionOutcome};
pub use ledger::{BalanceLedger, SYSTEM_ACTOR};
pub use maturation::{MaturationScheduler, SweepReport};
pub use summary::{AffiliateSummary, SummaryReader};

#[cfg(test)]
mod testkit;
