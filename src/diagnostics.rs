//! Audit channel for discarded, clamped, and retried work.
//!
//! Every event the core drops or rewrites is observable here, independent of
//! the control-flow error path, so operators can audit reconciliation
//! decisions after the fact.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tracing::trace;

use crate::domain::Endpoint;

/// Default diagnostics buffer size
const DEFAULT_CAPACITY: usize = 1024;

/// One auditable decision made by the core
#[derive(Debug, Clone)]
pub enum DiagnosticEvent {
    /// An order update arrived with a sequence at or below the last applied
    DuplicateOrderEvent {
        order_id: String,
        sequence: u64,
        last_applied: u64,
    },
    /// An event targeted an order already in a terminal status
    StaleTerminalEvent {
        order_id: String,
        sequence: u64,
    },
    /// A fill id was seen more than once
    DuplicateFill {
        order_id: String,
        fill_id: String,
    },
    /// Received sequence skipped ahead; a snapshot refresh was scheduled
    SequenceGap {
        order_id: String,
        expected: u64,
        received: u64,
    },
    /// A fill would have pushed cumulative quantity past the order quantity
    ConsistencyViolation {
        order_id: String,
        detail: String,
    },
    /// An out-of-bounds funding sample was dropped
    FundingRejected {
        symbol: String,
        rate: Decimal,
        bound: Decimal,
    },
    /// An out-of-bounds funding sample was stored at the bound
    FundingClamped {
        symbol: String,
        raw: Decimal,
        clamped: Decimal,
    },
    /// Server-side rate-limit signal opened a backoff window
    RateLimitBackoff {
        endpoint: Endpoint,
        attempts: u32,
        delay_ms: u64,
    },
    /// A supervisor lost its connection and scheduled a retry
    Reconnecting {
        attempts: u32,
        delay_ms: u64,
    },
    /// An unparseable or unexpected stream message closed the connection
    ProtocolError {
        detail: String,
    },
    /// A connection error was escalated to the engine as fatal
    ConnectionEscalated {
        reason: String,
    },
    /// A cache write was dropped because shutdown had begun
    WriteAfterShutdown {
        component: &'static str,
    },
}

/// Timestamped diagnostic record as delivered to subscribers
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub event: DiagnosticEvent,
    pub timestamp: DateTime<Utc>,
}

/// Cloneable handle for emitting and subscribing to diagnostics.
///
/// Emission never blocks and never fails: with no subscribers the event is
/// simply dropped.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    tx: broadcast::Sender<Diagnostic>,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DiagnosticEvent) {
        trace!(?event, "diagnostic");
        let _ = self.tx.send(Diagnostic {
            event,
            timestamp: Utc::now(),
        });
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
