//! Assembly of the connectivity core.
//!
//! The hub owns the governor, the REST gateway, the caches, the lifecycle
//! tracker, and the dispatcher; it spawns stream supervisors and background
//! sweeps, and exposes the engine-facing read and control surface. `stop`
//! tears everything down: supervisors transition to shutdown, pending timers
//! are cancelled, and in-flight REST calls either complete or fail against
//! the shutdown deadline.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::{BalanceCache, BoundPolicy, FundingRateCache};
use crate::config::ConnectivityConfig;
use crate::coordination::{ShutdownController, ShutdownToken};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::domain::{ConnectionState, MarketEvent, StreamChannel, StreamEvent, Subscription};
use crate::error::Result;
use crate::exchange::{
    BalanceSource, Clock, RestTransport, SchemaAdapter, SnapshotSource, StreamTransport,
};
use crate::governor::RateGovernor;
use crate::orders::OrderLifecycleTracker;
use crate::rest::{RestGateway, RestGatewayConfig};
use crate::signing::Signer;
use crate::stream::{
    EventDispatcher, StreamSupervisor, StreamSupervisorConfig, SubscriptionRegistry,
};

/// External collaborators the hub is generic over.
pub struct HubServices {
    pub rest_transport: Arc<dyn RestTransport>,
    pub stream_transport: Arc<dyn StreamTransport>,
    pub adapter: Arc<dyn SchemaAdapter>,
    pub signer: Option<Arc<dyn Signer>>,
    pub clock: Arc<dyn Clock>,
    pub balance_source: Arc<dyn BalanceSource>,
    /// Snapshot source for automatic post-gap refreshes; without one, the
    /// engine drains `take_refresh_requests` itself.
    pub snapshot_source: Option<Arc<dyn SnapshotSource>>,
}

pub struct ConnectivityHub {
    config: ConnectivityConfig,
    services: HubServices,
    governor: Arc<RateGovernor>,
    gateway: Arc<RestGateway>,
    registry: Arc<SubscriptionRegistry>,
    tracker: Arc<OrderLifecycleTracker>,
    funding: Arc<FundingRateCache>,
    balances: Arc<BalanceCache>,
    dispatcher: Arc<EventDispatcher>,
    diagnostics: Diagnostics,
    shutdown: ShutdownController,
    events_tx: mpsc::Sender<StreamEvent>,
    refresh_requests: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectivityHub {
    /// Build the core and start its background tasks (dispatcher, eviction
    /// sweeps, snapshot refresher). Stream supervisors are spawned
    /// separately so public and private connections stay independent.
    pub fn start(config: ConnectivityConfig, services: HubServices) -> Self {
        let diagnostics = Diagnostics::default();
        let (shutdown, token) = ShutdownController::new();

        let governor = Arc::new(RateGovernor::with_backoff(
            config.governor.backoff_base(),
            config.governor.backoff_cap(),
            diagnostics.clone(),
        ));

        let gateway = Arc::new(RestGateway::new(
            governor.clone(),
            services.rest_transport.clone(),
            services.signer.clone(),
            services.clock.clone(),
            RestGatewayConfig {
                max_retries: config.rest.max_retries,
                retry_base: Duration::from_millis(config.rest.retry_base_ms),
                retry_cap: Duration::from_millis(config.rest.retry_cap_ms),
            },
            token.clone(),
        ));

        let (tracker, refresh_rx) = OrderLifecycleTracker::new(
            services.clock.clone(),
            Duration::from_secs(config.orders.terminal_grace_secs),
            diagnostics.clone(),
        );
        let tracker = Arc::new(tracker);

        let funding = Arc::new(FundingRateCache::new(
            config.funding.bound_per_hour,
            Duration::from_secs(config.funding.ttl_secs),
            services.clock.clone(),
            token.clone(),
            diagnostics.clone(),
        ));

        let balances = Arc::new(BalanceCache::new(
            governor.clone(),
            services.balance_source.clone(),
            Duration::from_secs(config.balance.ttl_secs),
            services.clock.clone(),
            token.clone(),
            diagnostics.clone(),
        ));

        let stream_policy = if config.funding.clamp_stream_samples {
            BoundPolicy::Clamp
        } else {
            BoundPolicy::Reject
        };
        let dispatcher = Arc::new(EventDispatcher::new(
            tracker.clone(),
            funding.clone(),
            stream_policy,
            token.clone(),
        ));

        let (events_tx, events_rx) = mpsc::channel(config.stream.event_queue_capacity);

        let hub = Self {
            config,
            services,
            governor,
            gateway,
            registry: Arc::new(SubscriptionRegistry::new()),
            tracker,
            funding,
            balances,
            dispatcher,
            diagnostics,
            shutdown,
            events_tx,
            refresh_requests: Mutex::new(Some(refresh_rx)),
            tasks: Mutex::new(Vec::new()),
        };

        hub.spawn_dispatcher(events_rx);
        hub.spawn_eviction_sweep(token.clone());
        hub.spawn_snapshot_refresher(token);
        hub
    }

    // -- engine-facing surface -------------------------------------------

    pub fn orders(&self) -> &Arc<OrderLifecycleTracker> {
        &self.tracker
    }

    pub fn funding(&self) -> &Arc<FundingRateCache> {
        &self.funding
    }

    pub fn balances(&self) -> &Arc<BalanceCache> {
        &self.balances
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub fn gateway(&self) -> &Arc<RestGateway> {
        &self.gateway
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }

    pub fn market_events(&self) -> broadcast::Receiver<MarketEvent> {
        self.dispatcher.market_events()
    }

    pub async fn subscribe(&self, channel: StreamChannel, symbol: &str) -> bool {
        self.registry.add(Subscription::new(channel, symbol)).await
    }

    pub async fn unsubscribe(&self, channel: StreamChannel, symbol: &str) -> bool {
        self.registry
            .remove(&Subscription::new(channel, symbol))
            .await
    }

    /// Refresh requests the tracker emitted, for engines that poll snapshots
    /// themselves. Only available when no snapshot source was configured.
    pub async fn take_refresh_requests(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.refresh_requests.lock().await.take()
    }

    // -- supervisors ------------------------------------------------------

    /// Spawn the public market-data connection.
    pub async fn spawn_public_stream(&self) -> watch::Receiver<ConnectionState> {
        self.spawn_stream(self.config.stream.public_url.clone(), false)
            .await
    }

    /// Spawn the authenticated user-stream connection.
    pub async fn spawn_private_stream(&self) -> watch::Receiver<ConnectionState> {
        self.spawn_stream(self.config.stream.private_url.clone(), true)
            .await
    }

    async fn spawn_stream(&self, url: String, authenticate: bool) -> watch::Receiver<ConnectionState> {
        let supervisor = StreamSupervisor::new(
            StreamSupervisorConfig {
                url,
                authenticate,
                reconnect_base: Duration::from_secs(self.config.stream.reconnect_base_secs),
                reconnect_cap: Duration::from_secs(self.config.stream.reconnect_cap_secs),
                reconnect_jitter: self.config.stream.reconnect_jitter,
                heartbeat_interval: Duration::from_secs(
                    self.config.stream.heartbeat_interval_secs,
                ),
                heartbeat_timeout: Duration::from_secs(self.config.stream.heartbeat_timeout_secs),
                auth_timeout: Duration::from_secs(self.config.stream.auth_timeout_secs),
                protocol_error_ceiling: self.config.stream.protocol_error_ceiling,
            },
            self.services.stream_transport.clone(),
            self.services.adapter.clone(),
            self.services.signer.clone(),
            self.services.clock.clone(),
            self.registry.clone(),
            self.events_tx.clone(),
            self.shutdown.token(),
            self.diagnostics.clone(),
        );
        let state = supervisor.state();

        let handle = tokio::spawn(async move {
            if let Err(e) = supervisor.run().await {
                // Fatal escalation: already on the diagnostics channel, the
                // state receiver shows the connection is gone.
                error!(error = %e, "stream supervisor terminated");
            }
        });
        self.tasks.lock().await.push(handle);
        state
    }

    // -- background tasks -------------------------------------------------

    fn spawn_dispatcher(&self, events_rx: mpsc::Receiver<StreamEvent>) {
        let dispatcher = self.dispatcher.clone();
        self.push_task(tokio::spawn(async move {
            dispatcher.run(events_rx).await;
        }));
    }

    fn spawn_eviction_sweep(&self, mut token: ShutdownToken) {
        let tracker = self.tracker.clone();
        let funding = self.funding.clone();
        let interval = Duration::from_secs(self.config.orders.eviction_interval_secs);
        let funding_max_age = Duration::from_secs(self.config.funding.evict_after_secs);

        self.push_task(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.wait() => break,
                    _ = ticker.tick() => {
                        tracker.evict_terminal();
                        funding.evict_older_than(funding_max_age);
                    }
                }
            }
        }));
    }

    fn spawn_snapshot_refresher(&self, mut token: ShutdownToken) {
        let source = match &self.services.snapshot_source {
            Some(source) => source.clone(),
            None => return,
        };
        let tracker = self.tracker.clone();
        let mut refresh_rx = match self.refresh_requests.try_lock() {
            Ok(mut guard) => match guard.take() {
                Some(rx) => rx,
                None => return,
            },
            Err(_) => return,
        };

        self.push_task(tokio::spawn(async move {
            loop {
                let order_id = tokio::select! {
                    _ = token.wait() => break,
                    order_id = refresh_rx.recv() => match order_id {
                        Some(order_id) => order_id,
                        None => break,
                    },
                };
                match source.fetch_order(&order_id).await {
                    Ok(snapshot) => tracker.apply_snapshot(snapshot),
                    Err(e) => warn!(order_id, error = %e, "snapshot refresh failed"),
                }
            }
        }));
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            tasks.push(handle);
        }
    }

    // -- shutdown ---------------------------------------------------------

    /// Stop the core: every supervisor transitions to shutdown, timers are
    /// cancelled, and tasks get until `deadline` to finish before they are
    /// aborted.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        info!("stopping connectivity hub");
        self.shutdown.trigger();

        let mut tasks = self.tasks.lock().await;
        let drain = async {
            for handle in tasks.iter_mut() {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!("shutdown deadline elapsed, aborting remaining tasks");
            for handle in tasks.iter() {
                handle.abort();
            }
        }
        tasks.clear();
        info!("connectivity hub stopped");
        Ok(())
    }
}
