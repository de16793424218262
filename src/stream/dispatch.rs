//! Drains decoded stream events into the stateful subsystems.
//!
//! One dispatcher per hub: supervisors feed a bounded queue, the dispatcher
//! applies order events to the lifecycle tracker, funding samples to the
//! rate cache, and fans market data out to engine subscribers. Per-order
//! sequencing is preserved because a single task does the applying.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::cache::funding::{BoundPolicy, FundingRateCache};
use crate::coordination::ShutdownToken;
use crate::domain::{MarketEvent, StreamEvent};
use crate::orders::OrderLifecycleTracker;

/// Market-data fan-out buffer; slow engine subscribers lag, they do not
/// block the dispatcher.
const MARKET_CHANNEL_CAPACITY: usize = 1024;

pub struct EventDispatcher {
    tracker: Arc<OrderLifecycleTracker>,
    funding: Arc<FundingRateCache>,
    funding_policy: BoundPolicy,
    market_tx: broadcast::Sender<MarketEvent>,
    shutdown: ShutdownToken,
}

impl EventDispatcher {
    pub fn new(
        tracker: Arc<OrderLifecycleTracker>,
        funding: Arc<FundingRateCache>,
        funding_policy: BoundPolicy,
        shutdown: ShutdownToken,
    ) -> Self {
        let (market_tx, _) = broadcast::channel(MARKET_CHANNEL_CAPACITY);
        Self {
            tracker,
            funding,
            funding_policy,
            market_tx,
            shutdown,
        }
    }

    /// Subscribe to public market data passing through the dispatcher.
    pub fn market_events(&self) -> broadcast::Receiver<MarketEvent> {
        self.market_tx.subscribe()
    }

    /// Drain the queue until shutdown or until every supervisor is gone.
    pub async fn run(&self, mut events_rx: mpsc::Receiver<StreamEvent>) {
        let mut shutdown = self.shutdown.clone();

        loop {
            let event = tokio::select! {
                _ = shutdown.wait() => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                StreamEvent::Order(order_event) => {
                    self.tracker.apply_event(order_event);
                }
                StreamEvent::Funding(sample) => {
                    let _ = self.funding.ingest(sample, self.funding_policy);
                }
                StreamEvent::Market(market_event) => {
                    debug!(symbol = market_event.symbol(), "market event");
                    let _ = self.market_tx.send(market_event);
                }
            }
        }

        info!("event dispatcher stopped");
    }
}
