//! In-memory fakes driving the connectivity core in integration tests:
//! a scripted stream transport, a minimal JSON wire schema, and static
//! REST sources.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;

use lanyard::{
    Balance, BalanceSource, Decoded, FillEvent, Frame, FundingRateSample, LanyardError,
    OrderEvent, OrderSnapshot, OrderStatus, RestRequest, RestResponse, RestTransport, Result,
    SchemaAdapter, Signer, SnapshotSource, StatusUpdate, StreamChannel, StreamConnection,
    StreamEvent, StreamTransport, Subscription,
};

/// One scripted connection as seen by the test: inject inbound frames,
/// inspect what the supervisor sent.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub inbound: mpsc::UnboundedSender<Frame>,
    pub sent: Arc<StdMutex<Vec<Frame>>>,
}

impl ConnectionHandle {
    pub fn inject(&self, message: serde_json::Value) {
        let _ = self.inbound.send(Frame::Text(message.to_string()));
    }

    pub fn inject_raw(&self, text: &str) {
        let _ = self.inbound.send(Frame::Text(text.to_string()));
    }

    /// Make the peer close the connection.
    pub fn close(&self) {
        let _ = self.inbound.send(Frame::Close);
    }

    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    /// Subscribe frames sent so far, as (channel, symbol) pairs in order.
    pub fn subscribe_frames(&self) -> Vec<(String, String)> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(text).ok()?;
                    (value["op"] == "subscribe").then(|| {
                        (
                            value["channel"].as_str().unwrap_or_default().to_string(),
                            value["symbol"].as_str().unwrap_or_default().to_string(),
                        )
                    })
                }
                _ => None,
            })
            .collect()
    }

    pub fn auth_frames(&self) -> usize {
        self.sent_frames()
            .iter()
            .filter(|frame| match frame {
                Frame::Text(text) => text.contains("\"op\":\"auth\""),
                _ => false,
            })
            .count()
    }
}

struct FakeConnection {
    inbound_rx: mpsc::UnboundedReceiver<Frame>,
    inbound_tx: mpsc::UnboundedSender<Frame>,
    sent: Arc<StdMutex<Vec<Frame>>>,
    auto_ack: bool,
    auth_success: bool,
}

#[async_trait]
impl StreamConnection for FakeConnection {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        if let Frame::Text(text) = &frame {
            if self.auto_ack {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
                    match value["op"].as_str() {
                        Some("subscribe") => {
                            let _ = self.inbound_tx.send(Frame::Text(
                                serde_json::json!({
                                    "op": "ack",
                                    "channel": value["channel"],
                                    "symbol": value["symbol"],
                                })
                                .to_string(),
                            ));
                        }
                        Some("auth") => {
                            let _ = self.inbound_tx.send(Frame::Text(
                                serde_json::json!({
                                    "op": "auth_ack",
                                    "success": self.auth_success,
                                    "reason": if self.auth_success {
                                        serde_json::Value::Null
                                    } else {
                                        "invalid credentials".into()
                                    },
                                })
                                .to_string(),
                            ));
                        }
                        _ => {}
                    }
                }
            }
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.inbound_rx.recv().await {
            Some(Frame::Close) => Ok(None),
            Some(frame) => Ok(Some(frame)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Stream transport handing out scripted in-memory connections and
/// reporting each one back to the test.
pub struct ScriptedTransport {
    handles_tx: mpsc::UnboundedSender<ConnectionHandle>,
    pub auto_ack: bool,
    pub auth_success: bool,
    fail_connects: AtomicU32,
}

impl ScriptedTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionHandle>) {
        let (handles_tx, handles_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                handles_tx,
                auto_ack: true,
                auth_success: true,
                fail_connects: AtomicU32::new(0),
            }),
            handles_rx,
        )
    }

    pub fn with_flags(
        auto_ack: bool,
        auth_success: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionHandle>) {
        let (handles_tx, handles_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                handles_tx,
                auto_ack,
                auth_success,
                fail_connects: AtomicU32::new(0),
            }),
            handles_rx,
        )
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn connect(&self, _url: &str) -> Result<Box<dyn StreamConnection>> {
        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(LanyardError::TransientNetwork(
                "scripted connect failure".to_string(),
            ));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let _ = self.handles_tx.send(ConnectionHandle {
            inbound: inbound_tx.clone(),
            sent: sent.clone(),
        });

        Ok(Box::new(FakeConnection {
            inbound_rx,
            inbound_tx,
            sent,
            auto_ack: self.auto_ack,
            auth_success: self.auth_success,
        }))
    }
}

fn channel_from_str(raw: &str) -> Option<StreamChannel> {
    match raw {
        "order_book" => Some(StreamChannel::OrderBook),
        "trades" => Some(StreamChannel::Trades),
        "user_orders" => Some(StreamChannel::UserOrders),
        "funding" => Some(StreamChannel::Funding),
        _ => None,
    }
}

/// Minimal JSON wire schema used by the fakes.
pub struct TestAdapter;

impl SchemaAdapter for TestAdapter {
    fn auth_frame(&self, signer: &dyn Signer, now: DateTime<Utc>) -> Result<Option<String>> {
        Ok(Some(
            serde_json::json!({
                "op": "auth",
                "key": signer.api_key(),
                "ts": now.timestamp_millis(),
            })
            .to_string(),
        ))
    }

    fn subscribe_frame(&self, subscription: &Subscription) -> Result<String> {
        Ok(serde_json::json!({
            "op": "subscribe",
            "channel": subscription.channel.as_str(),
            "symbol": subscription.symbol,
        })
        .to_string())
    }

    fn unsubscribe_frame(&self, subscription: &Subscription) -> Result<String> {
        Ok(serde_json::json!({
            "op": "unsubscribe",
            "channel": subscription.channel.as_str(),
            "symbol": subscription.symbol,
        })
        .to_string())
    }

    fn decode(&self, text: &str) -> Result<Decoded> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| LanyardError::Protocol(format!("unparseable frame: {}", e)))?;

        match value["op"].as_str() {
            Some("ack") => {
                let channel = value["channel"]
                    .as_str()
                    .and_then(channel_from_str)
                    .ok_or_else(|| LanyardError::Protocol("ack without channel".to_string()))?;
                let symbol = value["symbol"].as_str().unwrap_or_default();
                Ok(Decoded::SubscriptionAck(Subscription::new(channel, symbol)))
            }
            Some("auth_ack") => Ok(Decoded::AuthAck {
                success: value["success"].as_bool().unwrap_or(false),
                reason: value["reason"].as_str().map(String::from),
            }),
            Some("pong") => Ok(Decoded::Pong),
            Some("noise") => Ok(Decoded::Ignore),
            Some("fill") => Ok(Decoded::Event(StreamEvent::Order(OrderEvent::Fill(
                FillEvent {
                    order_id: value["order_id"].as_str().unwrap_or_default().to_string(),
                    fill_id: value["fill_id"].as_str().unwrap_or_default().to_string(),
                    quantity: decimal(&value["qty"]),
                    price: decimal(&value["price"]),
                    timestamp: Utc::now(),
                    sequence: value["seq"].as_u64().unwrap_or_default(),
                },
            )))),
            Some("status") => {
                let status = match value["status"].as_str() {
                    Some("open") => OrderStatus::Open,
                    Some("partially-filled") => OrderStatus::PartiallyFilled,
                    Some("filled") => OrderStatus::Filled,
                    Some("cancelled") => OrderStatus::Cancelled,
                    Some("rejected") => OrderStatus::Rejected,
                    other => {
                        return Err(LanyardError::Protocol(format!(
                            "unknown status {:?}",
                            other
                        )))
                    }
                };
                Ok(Decoded::Event(StreamEvent::Order(OrderEvent::Status(
                    StatusUpdate {
                        order_id: value["order_id"].as_str().unwrap_or_default().to_string(),
                        status,
                        filled_quantity: value.get("filled").map(decimal),
                        timestamp: Utc::now(),
                        sequence: value["seq"].as_u64().unwrap_or_default(),
                    },
                ))))
            }
            Some("trade") => Ok(Decoded::Event(StreamEvent::Market(
                lanyard::MarketEvent::Trade {
                    symbol: value["symbol"].as_str().unwrap_or_default().to_string(),
                    price: decimal(&value["price"]),
                    quantity: decimal(&value["qty"]),
                    timestamp: Utc::now(),
                },
            ))),
            Some("funding") => Ok(Decoded::Event(StreamEvent::Funding(FundingRateSample {
                symbol: value["symbol"].as_str().unwrap_or_default().to_string(),
                rate: decimal(&value["rate"]),
                interval: Duration::from_secs(value["interval_secs"].as_u64().unwrap_or(3600)),
                timestamp: Utc::now(),
                source: lanyard::domain::RateSource::Stream,
            }))),
            other => Err(LanyardError::Protocol(format!(
                "unexpected message op {:?}",
                other
            ))),
        }
    }
}

fn decimal(value: &serde_json::Value) -> Decimal {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| value.as_f64().and_then(|f| Decimal::try_from(f).ok()))
        .unwrap_or_default()
}

/// REST transport for hub tests; nothing in these tests issues raw REST.
pub struct NullRestTransport;

#[async_trait]
impl RestTransport for NullRestTransport {
    async fn send(&self, _request: RestRequest) -> Result<RestResponse> {
        Ok(RestResponse {
            status: 200,
            body: serde_json::json!({}),
        })
    }
}

/// Balance source returning a fixed balance and counting fetches.
pub struct StaticBalanceSource {
    pub fetches: AtomicU32,
}

impl StaticBalanceSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicU32::new(0),
        })
    }

    pub fn count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BalanceSource for StaticBalanceSource {
    async fn fetch_balance(&self, asset: &str) -> Result<Balance> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(Balance {
            asset: asset.to_string(),
            wallet: Decimal::from(1000),
            available: Decimal::from(900),
            fetched_at: Utc::now(),
        })
    }
}

/// Snapshot source answering every refresh with a fixed open order.
pub struct StaticSnapshotSource {
    pub quantity: Decimal,
    pub filled: Decimal,
    pub sequence: u64,
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    async fn fetch_order(&self, order_id: &str) -> Result<OrderSnapshot> {
        Ok(OrderSnapshot {
            order_id: order_id.to_string(),
            client_order_id: format!("c-{}", order_id),
            symbol: "ENAUSDT".to_string(),
            side: lanyard::domain::OrderSide::Buy,
            status: if self.filled >= self.quantity {
                OrderStatus::Filled
            } else if self.filled > Decimal::ZERO {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Open
            },
            quantity: self.quantity,
            filled_quantity: self.filled,
            sequence: self.sequence,
            timestamp: Utc::now(),
        })
    }
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async variant of `wait_until` for conditions that need awaiting.
#[macro_export]
macro_rules! wait_until_async {
    ($timeout:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + $timeout;
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not met within {:?}",
                $timeout
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}
