//! Order/fill state reconciliation.
//!
//! Merges REST order snapshots and streamed fill/status events into one
//! consistent per-order state. Every update carries a per-order sequence
//! number; updates are applied in sequence order regardless of arrival
//! order. Ahead-of-sequence updates are buffered until the missing ones
//! arrive, and a REST snapshot refresh is scheduled in case they never do.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::domain::{FillEvent, OrderEvent, OrderRecord, OrderSnapshot, OrderStatus, StatusUpdate};
use crate::exchange::Clock;

/// Ahead-of-sequence updates held per order; beyond this the snapshot
/// refresh is the only repair path.
const GAP_BUFFER_LIMIT: usize = 256;

struct TrackedOrder {
    record: OrderRecord,
    fill_ids: HashSet<String>,
    gap_buffer: BTreeMap<u64, OrderEvent>,
}

/// Merges snapshots and streamed events into per-order state.
///
/// Sole owner of every `OrderRecord`: no other subsystem writes order state.
pub struct OrderLifecycleTracker {
    orders: DashMap<String, TrackedOrder>,
    refresh_tx: mpsc::UnboundedSender<String>,
    clock: Arc<dyn Clock>,
    terminal_grace: Duration,
    diagnostics: Diagnostics,
}

impl OrderLifecycleTracker {
    /// Returns the tracker plus the channel on which it requests REST
    /// snapshot refreshes for orders whose state turned suspect.
    pub fn new(
        clock: Arc<dyn Clock>,
        terminal_grace: Duration,
        diagnostics: Diagnostics,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        (
            Self {
                orders: DashMap::new(),
                refresh_tx,
                clock,
                terminal_grace,
                diagnostics,
            },
            refresh_rx,
        )
    }

    /// Current reconciled state for one order.
    pub fn status(&self, order_id: &str) -> Option<OrderRecord> {
        self.orders.get(order_id).map(|t| t.record.clone())
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Apply an authoritative REST snapshot. Idempotent.
    pub fn apply_snapshot(&self, snapshot: OrderSnapshot) {
        if snapshot.filled_quantity > snapshot.quantity {
            self.diagnostics.emit(DiagnosticEvent::ConsistencyViolation {
                order_id: snapshot.order_id.clone(),
                detail: format!(
                    "snapshot filled {} exceeds quantity {}",
                    snapshot.filled_quantity, snapshot.quantity
                ),
            });
            return;
        }

        match self.orders.entry(snapshot.order_id.clone()) {
            Entry::Vacant(vacant) => {
                debug!(order_id = %snapshot.order_id, "order created from snapshot");
                vacant.insert(self.tracked_from_snapshot(snapshot));
            }
            Entry::Occupied(mut occupied) => {
                let tracked = occupied.get_mut();
                if tracked.record.status.is_terminal() {
                    self.diagnostics.emit(DiagnosticEvent::StaleTerminalEvent {
                        order_id: snapshot.order_id.clone(),
                        sequence: snapshot.sequence,
                    });
                    return;
                }

                if snapshot.sequence == 0 {
                    self.refresh_from_unversioned(tracked, snapshot);
                } else if snapshot.sequence > tracked.record.last_sequence {
                    self.refresh_versioned(tracked, snapshot);
                } else {
                    self.diagnostics.emit(DiagnosticEvent::DuplicateOrderEvent {
                        order_id: snapshot.order_id.clone(),
                        sequence: snapshot.sequence,
                        last_applied: tracked.record.last_sequence,
                    });
                }
            }
        }
    }

    /// Apply one streamed fill or status update. Idempotent.
    pub fn apply_event(&self, event: OrderEvent) {
        let order_id = event.order_id().to_string();

        match self.orders.entry(order_id.clone()) {
            Entry::Vacant(vacant) => {
                // First observation of this order came off the stream; the
                // record starts incomplete and a snapshot is requested.
                debug!(order_id = %order_id, "order created from stream event");
                let mut tracked = self.tracked_from_event(&event);
                self.apply_in_sequence(&mut tracked, event);
                self.mark_suspect(&mut tracked);
                vacant.insert(tracked);
            }
            Entry::Occupied(mut occupied) => {
                let tracked = occupied.get_mut();

                if tracked.record.status.is_terminal() {
                    self.diagnostics.emit(DiagnosticEvent::StaleTerminalEvent {
                        order_id,
                        sequence: event.sequence(),
                    });
                    return;
                }

                let sequence = event.sequence();
                let last = tracked.record.last_sequence;
                if sequence <= last {
                    self.diagnostics.emit(DiagnosticEvent::DuplicateOrderEvent {
                        order_id,
                        sequence,
                        last_applied: last,
                    });
                    return;
                }

                if sequence == last + 1 {
                    self.apply_in_sequence(tracked, event);
                    self.drain_buffer(tracked);
                } else {
                    // Ahead of sequence: hold it for in-order application
                    // and get a snapshot on the way in case the missing
                    // updates never show up.
                    self.diagnostics.emit(DiagnosticEvent::SequenceGap {
                        order_id,
                        expected: last + 1,
                        received: sequence,
                    });
                    if tracked.gap_buffer.len() < GAP_BUFFER_LIMIT {
                        tracked.gap_buffer.insert(sequence, event);
                    }
                    self.mark_suspect(tracked);
                }
            }
        }
    }

    /// Evict terminal orders past the grace period. Returns how many were
    /// removed.
    pub fn evict_terminal(&self) -> usize {
        let now = self.clock.wall();
        let grace = chrono::Duration::from_std(self.terminal_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let before = self.orders.len();
        self.orders.retain(|_, tracked| {
            match tracked.record.terminal_at {
                Some(terminal_at) => now.signed_duration_since(terminal_at) < grace,
                None => true,
            }
        });
        let evicted = before - self.orders.len();
        if evicted > 0 {
            info!(evicted, "evicted terminal orders");
        }
        evicted
    }

    fn tracked_from_snapshot(&self, snapshot: OrderSnapshot) -> TrackedOrder {
        let now = self.clock.wall();
        let terminal_at = snapshot.status.is_terminal().then_some(now);
        TrackedOrder {
            record: OrderRecord {
                order_id: snapshot.order_id,
                client_order_id: snapshot.client_order_id,
                symbol: snapshot.symbol,
                side: snapshot.side,
                status: snapshot.status,
                quantity: Some(snapshot.quantity),
                filled_quantity: snapshot.filled_quantity,
                last_sequence: snapshot.sequence,
                pending_refresh: false,
                terminal_at,
                created_at: now,
                updated_at: now,
            },
            fill_ids: HashSet::new(),
            gap_buffer: BTreeMap::new(),
        }
    }

    fn tracked_from_event(&self, event: &OrderEvent) -> TrackedOrder {
        let now = self.clock.wall();
        TrackedOrder {
            record: OrderRecord {
                order_id: event.order_id().to_string(),
                client_order_id: String::new(),
                symbol: String::new(),
                side: crate::domain::OrderSide::Buy,
                status: OrderStatus::Open,
                quantity: None,
                filled_quantity: Decimal::ZERO,
                last_sequence: event.sequence().saturating_sub(1),
                pending_refresh: false,
                terminal_at: None,
                created_at: now,
                updated_at: now,
            },
            fill_ids: HashSet::new(),
            gap_buffer: BTreeMap::new(),
        }
    }

    /// Apply an update whose sequence is exactly `last + 1` (or the first
    /// observed update for a fresh record).
    fn apply_in_sequence(&self, tracked: &mut TrackedOrder, event: OrderEvent) {
        match event {
            OrderEvent::Fill(fill) => self.apply_fill(tracked, fill),
            OrderEvent::Status(update) => self.apply_status(tracked, update),
        }
    }

    fn apply_fill(&self, tracked: &mut TrackedOrder, fill: FillEvent) {
        if tracked.fill_ids.contains(&fill.fill_id) {
            self.diagnostics.emit(DiagnosticEvent::DuplicateFill {
                order_id: fill.order_id.clone(),
                fill_id: fill.fill_id.clone(),
            });
            // The sequence slot is consumed even though the fill is not
            // re-applied.
            tracked.record.last_sequence = fill.sequence;
            return;
        }

        if let Some(quantity) = tracked.record.quantity {
            if tracked.record.filled_quantity + fill.quantity > quantity {
                warn!(
                    order_id = %fill.order_id,
                    fill_id = %fill.fill_id,
                    "fill would overflow order quantity, rejecting"
                );
                self.diagnostics.emit(DiagnosticEvent::ConsistencyViolation {
                    order_id: fill.order_id.clone(),
                    detail: format!(
                        "fill {} of {} would exceed quantity {} (filled {})",
                        fill.fill_id, fill.quantity, quantity, tracked.record.filled_quantity
                    ),
                });
                self.mark_suspect(tracked);
                return;
            }
        }

        tracked.record.filled_quantity += fill.quantity;
        tracked.fill_ids.insert(fill.fill_id);
        tracked.record.last_sequence = fill.sequence;
        tracked.record.updated_at = self.clock.wall();

        if tracked.record.quantity == Some(tracked.record.filled_quantity) {
            tracked.record.status = OrderStatus::Filled;
            tracked.record.terminal_at = Some(tracked.record.updated_at);
        } else if tracked.record.status == OrderStatus::Open {
            tracked.record.status = OrderStatus::PartiallyFilled;
        }
    }

    fn apply_status(&self, tracked: &mut TrackedOrder, update: StatusUpdate) {
        if let Some(cumulative) = update.filled_quantity {
            if let Some(quantity) = tracked.record.quantity {
                if cumulative > quantity {
                    self.diagnostics.emit(DiagnosticEvent::ConsistencyViolation {
                        order_id: update.order_id.clone(),
                        detail: format!(
                            "status update cumulative {} exceeds quantity {}",
                            cumulative, quantity
                        ),
                    });
                    self.mark_suspect(tracked);
                    return;
                }
            }
            // Cumulative quantity never decreases.
            tracked.record.filled_quantity = tracked.record.filled_quantity.max(cumulative);
        }

        tracked.record.status = update.status;
        tracked.record.last_sequence = update.sequence;
        tracked.record.updated_at = self.clock.wall();
        if update.status.is_terminal() {
            tracked.record.terminal_at = Some(tracked.record.updated_at);
        }
    }

    /// Apply buffered updates that have become contiguous.
    fn drain_buffer(&self, tracked: &mut TrackedOrder) {
        while let Some(event) = tracked
            .gap_buffer
            .remove(&(tracked.record.last_sequence + 1))
        {
            if tracked.record.status.is_terminal() {
                self.diagnostics.emit(DiagnosticEvent::StaleTerminalEvent {
                    order_id: tracked.record.order_id.clone(),
                    sequence: event.sequence(),
                });
                continue;
            }
            self.apply_in_sequence(tracked, event);
        }
        // Anything still buffered at or below the applied sequence is dead.
        let last = tracked.record.last_sequence;
        tracked.gap_buffer.retain(|seq, _| *seq > last);
    }

    /// Flag the order for a REST snapshot refresh, once per suspect phase.
    fn mark_suspect(&self, tracked: &mut TrackedOrder) {
        if !tracked.record.pending_refresh {
            tracked.record.pending_refresh = true;
            let _ = self.refresh_tx.send(tracked.record.order_id.clone());
        }
    }

    /// Versioned snapshot newer than everything applied so far.
    fn refresh_versioned(&self, tracked: &mut TrackedOrder, snapshot: OrderSnapshot) {
        tracked.record.client_order_id = snapshot.client_order_id;
        tracked.record.symbol = snapshot.symbol;
        tracked.record.side = snapshot.side;
        tracked.record.status = snapshot.status;
        tracked.record.quantity = Some(snapshot.quantity);
        tracked.record.filled_quantity = snapshot.filled_quantity;
        tracked.record.last_sequence = snapshot.sequence;
        tracked.record.pending_refresh = false;
        tracked.record.updated_at = self.clock.wall();
        if snapshot.status.is_terminal() {
            tracked.record.terminal_at = Some(tracked.record.updated_at);
        }
        self.drain_buffer(tracked);
    }

    /// Snapshot from a poll-only exchange that does not version its REST
    /// responses. Refreshes without regressing anything the stream already
    /// applied.
    fn refresh_from_unversioned(&self, tracked: &mut TrackedOrder, snapshot: OrderSnapshot) {
        tracked.record.quantity = Some(snapshot.quantity);
        if tracked.record.client_order_id.is_empty() {
            tracked.record.client_order_id = snapshot.client_order_id;
        }
        if tracked.record.symbol.is_empty() {
            tracked.record.symbol = snapshot.symbol;
            tracked.record.side = snapshot.side;
        }
        if snapshot.filled_quantity >= tracked.record.filled_quantity {
            tracked.record.filled_quantity = snapshot.filled_quantity;
            tracked.record.status = snapshot.status;
            if snapshot.status.is_terminal() {
                tracked.record.terminal_at = Some(self.clock.wall());
            }
        }
        tracked.record.pending_refresh = false;
        tracked.record.updated_at = self.clock.wall();
    }
}
