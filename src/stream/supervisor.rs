//! WebSocket connection lifecycle management.
//!
//! One supervisor owns exactly one connection: it connects, authenticates,
//! restores subscriptions from the registry, keeps the heartbeat alive, and
//! reconnects with capped exponential backoff. Multiple supervisors (public
//! market data vs. private user stream) run independently and share nothing
//! but the registry they were given.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::coordination::ShutdownToken;
use crate::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::domain::{ConnectionState, StreamEvent, Subscription};
use crate::error::{LanyardError, Result};
use crate::exchange::{Clock, Decoded, Frame, SchemaAdapter, StreamConnection, StreamTransport};
use crate::governor::{jittered, Backoff};
use crate::signing::Signer;
use crate::stream::registry::SubscriptionRegistry;

/// Per-connection supervisor settings.
#[derive(Debug, Clone)]
pub struct StreamSupervisorConfig {
    pub url: String,
    /// Whether this connection carries private channels and must
    /// authenticate before subscribing.
    pub authenticate: bool,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub reconnect_jitter: bool,
    /// How often to send an application-level ping
    pub heartbeat_interval: Duration,
    /// Declare the connection dead after this long without inbound activity
    pub heartbeat_timeout: Duration,
    /// How long to wait for the auth acknowledgement
    pub auth_timeout: Duration,
    /// Consecutive protocol errors before escalating as fatal
    pub protocol_error_ceiling: u32,
}

impl Default for StreamSupervisorConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            authenticate: false,
            reconnect_base: Duration::from_secs(5),
            reconnect_cap: Duration::from_secs(300),
            reconnect_jitter: true,
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
            auth_timeout: Duration::from_secs(10),
            protocol_error_ceiling: 5,
        }
    }
}

/// How one connected session ended.
enum SessionEnd {
    Shutdown,
    Disconnected(String),
    Protocol(LanyardError),
    Fatal(LanyardError),
}

/// Supervises one streaming connection through its whole lifecycle.
pub struct StreamSupervisor {
    config: StreamSupervisorConfig,
    transport: Arc<dyn StreamTransport>,
    adapter: Arc<dyn SchemaAdapter>,
    signer: Option<Arc<dyn Signer>>,
    clock: Arc<dyn Clock>,
    registry: Arc<SubscriptionRegistry>,
    events_tx: mpsc::Sender<StreamEvent>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    acked: Arc<RwLock<HashSet<Subscription>>>,
    shutdown: ShutdownToken,
    diagnostics: Diagnostics,
}

impl StreamSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: StreamSupervisorConfig,
        transport: Arc<dyn StreamTransport>,
        adapter: Arc<dyn SchemaAdapter>,
        signer: Option<Arc<dyn Signer>>,
        clock: Arc<dyn Clock>,
        registry: Arc<SubscriptionRegistry>,
        events_tx: mpsc::Sender<StreamEvent>,
        shutdown: ShutdownToken,
        diagnostics: Diagnostics,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            transport,
            adapter,
            signer,
            clock,
            registry,
            events_tx,
            state_tx,
            state_rx,
            acked: Arc::new(RwLock::new(HashSet::new())),
            shutdown,
            diagnostics,
        }
    }

    /// Observe connection state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Subscriptions acknowledged on the current connection.
    pub async fn acknowledged(&self) -> Vec<Subscription> {
        self.acked.read().await.iter().cloned().collect()
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_rx.borrow() != state {
            debug!(url = %self.config.url, %state, "connection state");
            let _ = self.state_tx.send(state);
        }
    }

    /// Drive the connection until shutdown or a fatal escalation.
    ///
    /// Recoverable failures (transport drops, heartbeat timeouts, isolated
    /// protocol errors) are absorbed by the reconnect loop and never
    /// returned to the caller.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = Backoff::new(self.config.reconnect_base, self.config.reconnect_cap);
        let mut shutdown = self.shutdown.clone();
        let mut consecutive_protocol_errors: u32 = 0;

        info!(url = %self.config.url, "stream supervisor starting");

        loop {
            if shutdown.is_shutdown() {
                self.set_state(ConnectionState::Shutdown);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = shutdown.wait() => {
                    self.set_state(ConnectionState::Shutdown);
                    return Ok(());
                }
                result = self.transport.connect(&self.config.url) => result,
            };

            let mut conn = match connected {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(url = %self.config.url, error = %e, "connect failed");
                    if !self.wait_to_retry(&mut backoff, &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            match self.session(conn.as_mut(), &mut backoff, &mut shutdown).await {
                SessionEnd::Shutdown => {
                    let _ = conn.close().await;
                    self.set_state(ConnectionState::Shutdown);
                    return Ok(());
                }
                SessionEnd::Disconnected(reason) => {
                    info!(url = %self.config.url, %reason, "connection lost");
                    consecutive_protocol_errors = 0;
                    let _ = conn.close().await;
                    if !self.wait_to_retry(&mut backoff, &mut shutdown).await {
                        return Ok(());
                    }
                }
                SessionEnd::Protocol(e) => {
                    consecutive_protocol_errors = consecutive_protocol_errors.saturating_add(1);
                    warn!(
                        url = %self.config.url,
                        error = %e,
                        consecutive = consecutive_protocol_errors,
                        "protocol error, closing connection"
                    );
                    self.diagnostics.emit(DiagnosticEvent::ProtocolError {
                        detail: e.to_string(),
                    });
                    let _ = conn.close().await;

                    if consecutive_protocol_errors >= self.config.protocol_error_ceiling {
                        let reason = format!(
                            "{} consecutive protocol errors, last: {}",
                            consecutive_protocol_errors, e
                        );
                        error!(url = %self.config.url, %reason, "escalating connection failure");
                        self.diagnostics
                            .emit(DiagnosticEvent::ConnectionEscalated {
                                reason: reason.clone(),
                            });
                        self.set_state(ConnectionState::Disconnected);
                        return Err(LanyardError::Protocol(reason));
                    }
                    if !self.wait_to_retry(&mut backoff, &mut shutdown).await {
                        return Ok(());
                    }
                }
                SessionEnd::Fatal(e) => {
                    error!(url = %self.config.url, error = %e, "fatal connection error");
                    self.diagnostics
                        .emit(DiagnosticEvent::ConnectionEscalated {
                            reason: e.to_string(),
                        });
                    let _ = conn.close().await;
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        }
    }

    /// Sleep out the reconnect backoff. Returns false if shutdown arrived
    /// during the wait (state already set to Shutdown).
    async fn wait_to_retry(&self, backoff: &mut Backoff, shutdown: &mut ShutdownToken) -> bool {
        self.set_state(ConnectionState::Reconnecting);

        let delay = backoff.advance();
        let delay = if self.config.reconnect_jitter {
            jittered(delay)
        } else {
            delay
        };
        self.diagnostics.emit(DiagnosticEvent::Reconnecting {
            attempts: backoff.attempts(),
            delay_ms: delay.as_millis() as u64,
        });
        info!(
            url = %self.config.url,
            attempts = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "reconnecting after delay"
        );

        tokio::select! {
            _ = shutdown.wait() => {
                self.set_state(ConnectionState::Shutdown);
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Authenticate, restore subscriptions, and pump frames until the
    /// session ends one way or another.
    async fn session(
        &self,
        conn: &mut dyn StreamConnection,
        backoff: &mut Backoff,
        shutdown: &mut ShutdownToken,
    ) -> SessionEnd {
        self.set_state(ConnectionState::Authenticating);
        if self.config.authenticate {
            match self.authenticate(conn, shutdown).await {
                Ok(true) => {}
                Ok(false) => return SessionEnd::Shutdown,
                Err(end) => return end,
            }
        }

        self.set_state(ConnectionState::Connected);
        backoff.reset();

        // Fresh session: nothing is acknowledged yet.
        self.acked.write().await.clear();
        let mut pending: HashSet<Subscription> = HashSet::new();

        // Watch before the initial sync so a registry change racing it is
        // picked up by the pump instead of lost.
        let registry_rx = self.registry.watch();

        if let Err(e) = self.sync_subscriptions(conn, &mut pending).await {
            return Self::classify(e);
        }

        self.pump(conn, &mut pending, registry_rx, shutdown).await
    }

    /// Send the auth frame and wait for the acknowledgement.
    /// `Ok(false)` means shutdown arrived while waiting.
    async fn authenticate(
        &self,
        conn: &mut dyn StreamConnection,
        shutdown: &mut ShutdownToken,
    ) -> std::result::Result<bool, SessionEnd> {
        let signer = match &self.signer {
            Some(signer) => signer,
            None => {
                return Err(SessionEnd::Fatal(LanyardError::Auth(
                    "private stream configured without a signer".to_string(),
                )))
            }
        };

        let frame = match self.adapter.auth_frame(signer.as_ref(), self.clock.wall()) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(true),
            // A signature we cannot produce will not improve on retry.
            Err(e) => return Err(SessionEnd::Fatal(e)),
        };

        if let Err(e) = conn.send(Frame::Text(frame)).await {
            return Err(SessionEnd::Disconnected(format!("auth send failed: {}", e)));
        }

        let deadline = Instant::now() + self.config.auth_timeout;
        loop {
            enum Step {
                Inbound(Result<Option<Frame>>),
                Timeout,
                Shutdown,
            }

            let step = tokio::select! {
                _ = shutdown.wait() => Step::Shutdown,
                _ = tokio::time::sleep_until(deadline) => Step::Timeout,
                frame = conn.next_frame() => Step::Inbound(frame),
            };

            match step {
                Step::Shutdown => return Ok(false),
                Step::Timeout => {
                    return Err(SessionEnd::Disconnected("auth ack timeout".to_string()))
                }
                Step::Inbound(Ok(None)) => {
                    return Err(SessionEnd::Disconnected(
                        "closed during auth handshake".to_string(),
                    ))
                }
                Step::Inbound(Err(e)) => {
                    return Err(SessionEnd::Disconnected(format!("auth read failed: {}", e)))
                }
                Step::Inbound(Ok(Some(Frame::Text(text)))) => {
                    match self.adapter.decode(&text) {
                        Ok(Decoded::AuthAck { success: true, .. }) => return Ok(true),
                        Ok(Decoded::AuthAck {
                            success: false,
                            reason,
                        }) => {
                            return Err(SessionEnd::Fatal(LanyardError::Auth(
                                reason.unwrap_or_else(|| "authentication rejected".to_string()),
                            )))
                        }
                        Ok(_) => continue,
                        Err(e) => return Err(SessionEnd::Protocol(e)),
                    }
                }
                Step::Inbound(Ok(Some(_))) => continue,
            }
        }
    }

    /// Align the live connection with the registry: subscribe to missing
    /// entries in insertion order, unsubscribe from entries no longer
    /// desired. Already-acknowledged or in-flight subscriptions are never
    /// re-sent.
    async fn sync_subscriptions(
        &self,
        conn: &mut dyn StreamConnection,
        pending: &mut HashSet<Subscription>,
    ) -> Result<()> {
        let desired = self.registry.snapshot().await;
        let desired_set: HashSet<Subscription> = desired.iter().cloned().collect();

        for subscription in &desired {
            {
                let acked = self.acked.read().await;
                if acked.contains(subscription) || pending.contains(subscription) {
                    continue;
                }
            }
            let frame = self.adapter.subscribe_frame(subscription)?;
            conn.send(Frame::Text(frame)).await?;
            debug!(%subscription, "subscribe sent");
            pending.insert(subscription.clone());
        }

        let stale: Vec<Subscription> = {
            let acked = self.acked.read().await;
            acked
                .iter()
                .filter(|s| !desired_set.contains(*s))
                .cloned()
                .collect()
        };
        for subscription in stale {
            let frame = self.adapter.unsubscribe_frame(&subscription)?;
            conn.send(Frame::Text(frame)).await?;
            debug!(%subscription, "unsubscribe sent");
            self.acked.write().await.remove(&subscription);
        }
        pending.retain(|s| desired_set.contains(s));

        Ok(())
    }

    /// Main frame pump for one connected session.
    async fn pump(
        &self,
        conn: &mut dyn StreamConnection,
        pending: &mut HashSet<Subscription>,
        mut registry_rx: tokio::sync::watch::Receiver<u64>,
        shutdown: &mut ShutdownToken,
    ) -> SessionEnd {
        let mut ping_interval = tokio::time::interval(self.config.heartbeat_interval);
        // The first tick fires immediately; skip it so pings start one
        // interval in.
        ping_interval.tick().await;

        let mut last_activity = Instant::now();

        loop {
            enum Step {
                Inbound(Result<Option<Frame>>),
                PingDue,
                RegistryChanged,
                Shutdown,
            }

            let step = tokio::select! {
                _ = shutdown.wait() => Step::Shutdown,
                frame = conn.next_frame() => Step::Inbound(frame),
                _ = ping_interval.tick() => Step::PingDue,
                changed = registry_rx.changed() => {
                    if changed.is_ok() {
                        Step::RegistryChanged
                    } else {
                        // Registry dropped; nothing left to track.
                        Step::Shutdown
                    }
                }
            };

            match step {
                Step::Shutdown => return SessionEnd::Shutdown,
                Step::PingDue => {
                    if last_activity.elapsed() > self.config.heartbeat_timeout {
                        return SessionEnd::Disconnected(format!(
                            "heartbeat timeout after {:?}",
                            last_activity.elapsed()
                        ));
                    }
                    if let Err(e) = conn.send(self.adapter.ping_frame()).await {
                        return SessionEnd::Disconnected(format!("ping send failed: {}", e));
                    }
                }
                Step::RegistryChanged => {
                    if let Err(e) = self.sync_subscriptions(conn, pending).await {
                        return Self::classify(e);
                    }
                }
                Step::Inbound(Ok(None)) => {
                    return SessionEnd::Disconnected("stream ended".to_string())
                }
                Step::Inbound(Err(e)) => {
                    return SessionEnd::Disconnected(format!("read failed: {}", e))
                }
                Step::Inbound(Ok(Some(frame))) => {
                    last_activity = Instant::now();
                    match frame {
                        Frame::Text(text) => match self.adapter.decode(&text) {
                            Ok(Decoded::Event(event)) => {
                                if self.events_tx.send(event).await.is_err() {
                                    // Dispatcher gone: the core is tearing down.
                                    return SessionEnd::Shutdown;
                                }
                            }
                            Ok(Decoded::SubscriptionAck(subscription)) => {
                                pending.remove(&subscription);
                                debug!(%subscription, "subscription acknowledged");
                                self.acked.write().await.insert(subscription);
                            }
                            Ok(Decoded::AuthAck { .. }) => {}
                            Ok(Decoded::Pong) | Ok(Decoded::Ignore) => {}
                            Err(e) => return SessionEnd::Protocol(e),
                        },
                        Frame::Ping(data) => {
                            if let Err(e) = conn.send(Frame::Pong(data)).await {
                                return SessionEnd::Disconnected(format!(
                                    "pong send failed: {}",
                                    e
                                ));
                            }
                        }
                        Frame::Pong(_) => {}
                        Frame::Close => {
                            return SessionEnd::Disconnected("close frame received".to_string())
                        }
                        Frame::Binary(_) => {
                            debug!("ignoring unexpected binary frame");
                        }
                    }
                }
            }
        }
    }

    fn classify(error: LanyardError) -> SessionEnd {
        match error {
            e @ LanyardError::Protocol(_) => SessionEnd::Protocol(e),
            e if e.is_fatal() => SessionEnd::Fatal(e),
            e => SessionEnd::Disconnected(e.to_string()),
        }
    }
}
