pub mod cache;
pub mod config;
pub mod coordination;
pub mod diagnostics;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod governor;
pub mod hub;
pub mod orders;
pub mod rest;
pub mod signing;
pub mod stream;
pub mod telemetry;

pub use cache::{BalanceCache, BoundPolicy, FundingRateCache, IngestOutcome, RateReading};
pub use config::ConnectivityConfig;
pub use coordination::{ShutdownController, ShutdownToken};
pub use diagnostics::{Diagnostic, DiagnosticEvent, Diagnostics};
pub use domain::{
    Balance, ConnectionState, Endpoint, FillEvent, FundingRateSample, MarketEvent, OrderEvent,
    OrderRecord, OrderSnapshot, OrderStatus, RateLimit, StatusUpdate, StreamChannel, StreamEvent,
    Subscription,
};
pub use error::{LanyardError, Result};
pub use exchange::{
    BalanceSource, Clock, Decoded, Frame, HttpTransport, RestRequest, RestResponse, RestTransport,
    SchemaAdapter, SnapshotSource, StreamConnection, StreamTransport, SystemClock, WsTransport,
};
pub use governor::{Backoff, Permit, RateGovernor};
pub use hub::{ConnectivityHub, HubServices};
pub use orders::OrderLifecycleTracker;
pub use rest::{RestGateway, RestGatewayConfig};
pub use signing::{ApiCredentials, HmacSigner, SignRequest, Signer};
pub use stream::{EventDispatcher, StreamSupervisor, StreamSupervisorConfig, SubscriptionRegistry};
