use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order status as reconciled by the lifecycle tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Acknowledged by the exchange, no fills yet
    Open,
    /// Some quantity executed
    PartiallyFilled,
    /// Fully executed
    Filled,
    /// Cancelled before completion
    Cancelled,
    /// Rejected by the exchange
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses are sticky: no event may transition out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially-filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// Reconciled per-order state, owned exclusively by the lifecycle tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Exchange-assigned order id
    pub order_id: String,
    /// Client-assigned id, carried through acks
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    /// Total order quantity; unknown until a snapshot/ack is seen when the
    /// first observation was a streamed fill
    pub quantity: Option<Decimal>,
    /// Cumulative executed quantity, never exceeds `quantity`
    pub filled_quantity: Decimal,
    /// Highest sequence number applied so far
    pub last_sequence: u64,
    /// Set when a sequence gap was observed; cleared by the next snapshot
    pub pending_refresh: bool,
    /// When the order reached a terminal status (drives eviction)
    pub terminal_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    pub fn new_client_order_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn remaining_quantity(&self) -> Option<Decimal> {
        self.quantity.map(|q| q - self.filled_quantity)
    }
}

/// Immutable record of one execution, consumed at most once per fill id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: String,
    pub fill_id: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Per-order monotonically increasing sequence number
    pub sequence: u64,
}

/// Streamed order status change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub order_id: String,
    pub status: OrderStatus,
    /// Cumulative filled quantity as reported alongside the status, if any
    pub filled_quantity: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

/// A streamed update to one order's state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderEvent {
    Fill(FillEvent),
    Status(StatusUpdate),
}

impl OrderEvent {
    pub fn order_id(&self) -> &str {
        match self {
            OrderEvent::Fill(f) => &f.order_id,
            OrderEvent::Status(s) => &s.order_id,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            OrderEvent::Fill(f) => f.sequence,
            OrderEvent::Status(s) => s.sequence,
        }
    }
}

/// REST order snapshot, the authoritative resynchronization source.
///
/// `sequence == 0` marks a poll-derived snapshot from an exchange that does
/// not version its REST responses; such snapshots refresh state without
/// advancing the sequence counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Open.is_active());
        assert!(OrderStatus::PartiallyFilled.is_active());
    }

    #[test]
    fn test_remaining_quantity() {
        let now = Utc::now();
        let record = OrderRecord {
            order_id: "o-1".into(),
            client_order_id: OrderRecord::new_client_order_id(),
            symbol: "ENAUSDT".into(),
            side: OrderSide::Buy,
            status: OrderStatus::PartiallyFilled,
            quantity: Some(dec!(10)),
            filled_quantity: dec!(4),
            last_sequence: 3,
            pending_refresh: false,
            terminal_at: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(record.remaining_quantity(), Some(dec!(6)));
    }
}
