use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{FundingRateSample, OrderEvent};

/// Streaming channel kinds the exchange exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChannel {
    OrderBook,
    Trades,
    UserOrders,
    Funding,
}

impl StreamChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamChannel::OrderBook => "order_book",
            StreamChannel::Trades => "trades",
            StreamChannel::UserOrders => "user_orders",
            StreamChannel::Funding => "funding",
        }
    }

    /// Private channels require an authenticated connection.
    pub fn is_private(&self) -> bool {
        matches!(self, StreamChannel::UserOrders)
    }
}

impl std::fmt::Display for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A (channel, symbol) pair the engine wants streamed.
///
/// Lives in the registry from the moment it is requested until explicitly
/// removed, independent of any one connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub channel: StreamChannel,
    pub symbol: String,
}

impl Subscription {
    pub fn new(channel: StreamChannel, symbol: impl Into<String>) -> Self {
        Self {
            channel,
            symbol: symbol.into(),
        }
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel, self.symbol)
    }
}

/// One stream supervisor's current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    Shutdown,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

/// Public market data forwarded to the engine without reconciliation
#[derive(Debug, Clone)]
pub enum MarketEvent {
    BookTop {
        symbol: String,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
        timestamp: DateTime<Utc>,
    },
    Trade {
        symbol: String,
        price: Decimal,
        quantity: Decimal,
        timestamp: DateTime<Utc>,
    },
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            MarketEvent::BookTop { symbol, .. } => symbol,
            MarketEvent::Trade { symbol, .. } => symbol,
        }
    }
}

/// Decoded event coming off a supervised stream, drained by the dispatcher.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Order(OrderEvent),
    Funding(FundingRateSample),
    Market(MarketEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_identity() {
        let a = Subscription::new(StreamChannel::Funding, "ENAUSDT");
        let b = Subscription::new(StreamChannel::Funding, "ENAUSDT");
        let c = Subscription::new(StreamChannel::Trades, "ENAUSDT");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "funding:ENAUSDT");
    }

    #[test]
    fn test_private_channels() {
        assert!(StreamChannel::UserOrders.is_private());
        assert!(!StreamChannel::OrderBook.is_private());
    }
}
