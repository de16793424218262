use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Logical REST operation group, each governed by its own rate budget.
///
/// The exchange documents limits per operation group, not per URL, so the
/// governor keys its budgets on this enum rather than on raw paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Endpoint {
    PlaceOrder,
    CancelOrder,
    OrderStatus,
    WalletBalance,
    Positions,
    FundingRate,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::PlaceOrder => "place-order",
            Endpoint::CancelOrder => "cancel-order",
            Endpoint::OrderStatus => "order-status",
            Endpoint::WalletBalance => "wallet-balance",
            Endpoint::Positions => "positions",
            Endpoint::FundingRate => "funding-rate",
        }
    }

    /// Documented per-group limit, used unless overridden in config.
    pub fn default_limit(&self) -> RateLimit {
        match self {
            // Order entry endpoints share the strictest budget.
            Endpoint::PlaceOrder => RateLimit::per_minute(600),
            Endpoint::CancelOrder => RateLimit::per_minute(600),
            Endpoint::OrderStatus => RateLimit::per_minute(600),
            // Account reads are cheaper but still bounded.
            Endpoint::WalletBalance => RateLimit::per_minute(120),
            Endpoint::Positions => RateLimit::per_minute(120),
            Endpoint::FundingRate => RateLimit::per_minute(120),
        }
    }

    pub fn all() -> [Endpoint; 6] {
        [
            Endpoint::PlaceOrder,
            Endpoint::CancelOrder,
            Endpoint::OrderStatus,
            Endpoint::WalletBalance,
            Endpoint::Positions,
            Endpoint::FundingRate,
        ]
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Weighted-call capacity per rolling window for one endpoint group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Total weight admitted per window
    pub capacity: u32,
    /// Window length after which the budget refills
    pub window: Duration,
}

impl RateLimit {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self { capacity, window }
    }

    pub fn per_minute(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    pub fn per_second(capacity: u32) -> Self {
        Self::new(capacity, Duration::from_secs(1))
    }
}
