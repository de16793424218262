pub mod balance;
pub mod funding;

pub use balance::BalanceCache;
pub use funding::{BoundPolicy, FundingRateCache, IngestOutcome, RateReading};
