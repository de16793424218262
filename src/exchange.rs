//! Collaborator seams: REST and stream transports, the schema adapter that
//! owns all exchange-specific wire shapes, snapshot/balance sources, and the
//! clock.
//!
//! The core is generic over these traits; spot and derivative connectors
//! provide implementations without inheriting any shared base type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::{Balance, OrderSnapshot, StreamEvent, Subscription};
use crate::error::{LanyardError, Result};
use crate::signing::Signer;

/// Monotonic time source plus wall-clock timestamps.
///
/// TTLs, backoff, and heartbeat timeouts are judged against `now()`; only
/// signatures and exchange-facing payloads use `wall()`.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn wall(&self) -> DateTime<Utc>;
}

/// Production clock backed by the tokio runtime (virtualizable in tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One outbound REST call, independent of any HTTP client.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub headers: HeaderMap,
}

impl RestRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        let mut req = Self::new(Method::POST, path);
        req.body = Some(body);
        req
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Query string exactly as it will be sent, for signing.
    pub fn canonical_query(&self) -> String {
        self.query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Body serialized the way it will be sent, for signing.
    pub fn canonical_body(&self) -> String {
        self.body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default()
    }
}

/// Raw REST response: status code plus parsed body.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl RestResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Abstract REST call. Implementations report transport-level failures as
/// errors; HTTP error statuses come back as a normal response for the
/// gateway to classify.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RestTransport: Send + Sync {
    async fn send(&self, request: RestRequest) -> Result<RestResponse>;
}

/// Default REST transport backed by reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lanyard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LanyardError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RestTransport for HttpTransport {
    async fn send(&self, request: RestRequest) -> Result<RestResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(request.method, url)
            .headers(request.headers);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = request.body {
            builder = builder.json(&body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        // Error bodies are not always JSON; keep the status and move on.
        let body = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);

        Ok(RestResponse { status, body })
    }
}

/// A single frame on a streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// One live streaming connection.
#[async_trait]
pub trait StreamConnection: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;
    /// Next inbound frame; `None` means the peer closed the stream.
    async fn next_frame(&mut self) -> Result<Option<Frame>>;
    async fn close(&mut self) -> Result<()>;
}

/// Abstract streaming transport: opens connections for a supervisor.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>>;
}

/// Default streaming transport backed by tokio-tungstenite.
pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>> {
        let url = url::Url::parse(url)
            .map_err(|e| LanyardError::Internal(format!("invalid WebSocket URL: {}", e)))?;

        let (ws_stream, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| LanyardError::TransientNetwork("WebSocket connection timeout".to_string()))?
        .map_err(LanyardError::WebSocket)?;

        Ok(Box::new(WsConnection { inner: ws_stream }))
    }
}

struct WsConnection {
    inner: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl StreamConnection for WsConnection {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message;

        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        };
        self.inner.send(message).await.map_err(LanyardError::WebSocket)
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>> {
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::Message;

        loop {
            return match self.inner.next().await {
                None => Ok(None),
                Some(Err(e)) => Err(LanyardError::WebSocket(e)),
                Some(Ok(message)) => match message {
                    Message::Text(text) => Ok(Some(Frame::Text(text))),
                    Message::Binary(data) => Ok(Some(Frame::Binary(data))),
                    Message::Ping(data) => Ok(Some(Frame::Ping(data))),
                    Message::Pong(data) => Ok(Some(Frame::Pong(data))),
                    Message::Close(_) => Ok(Some(Frame::Close)),
                    // Raw frames are a tungstenite internal; skip them.
                    Message::Frame(_) => continue,
                },
            };
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close(None)
            .await
            .map_err(LanyardError::WebSocket)
    }
}

/// Outcome of decoding one inbound text frame.
#[derive(Debug, Clone)]
pub enum Decoded {
    /// An event for the dispatcher
    Event(StreamEvent),
    /// The exchange acknowledged one subscription
    SubscriptionAck(Subscription),
    /// Authentication outcome
    AuthAck { success: bool, reason: Option<String> },
    /// Application-level heartbeat reply
    Pong,
    /// Recognized but irrelevant (welcome banners, echo, etc.)
    Ignore,
}

/// Exchange-specific wire mapping: subscribe/auth/heartbeat frames and
/// inbound decoding. All topic strings and error-code taxonomies live behind
/// this trait, never in the core.
pub trait SchemaAdapter: Send + Sync {
    /// Auth frame for the handshake, or `None` for public streams.
    fn auth_frame(&self, signer: &dyn Signer, now: DateTime<Utc>) -> Result<Option<String>>;

    fn subscribe_frame(&self, subscription: &Subscription) -> Result<String>;

    fn unsubscribe_frame(&self, subscription: &Subscription) -> Result<String>;

    /// Application-level heartbeat frame.
    fn ping_frame(&self) -> Frame {
        Frame::Ping(Vec::new())
    }

    /// Decode one inbound text frame. Unparseable input is a
    /// `LanyardError::Protocol`.
    fn decode(&self, text: &str) -> Result<Decoded>;
}

/// REST source for authoritative order snapshots, used to resynchronize
/// after a sequence gap.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_order(&self, order_id: &str) -> Result<OrderSnapshot>;
}

/// REST source for wallet balances, called through the governor by the
/// balance cache.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn fetch_balance(&self, asset: &str) -> Result<Balance>;
}
