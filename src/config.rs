use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub rest: RestConfig,
    #[serde(default)]
    pub funding: FundingConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub orders: OrdersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GovernorConfig {
    /// Base delay applied on the first server-side rate-limit signal
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Cap on any backoff window
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

fn default_backoff_base_secs() -> u64 {
    2
}

fn default_backoff_cap_secs() -> u64 {
    300
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

impl GovernorConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// WebSocket endpoint for public market data
    #[serde(default)]
    pub public_url: String,
    /// WebSocket endpoint for the private user stream
    #[serde(default)]
    pub private_url: String,
    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: u64,
    #[serde(default = "default_reconnect_cap_secs")]
    pub reconnect_cap_secs: u64,
    #[serde(default = "default_true")]
    pub reconnect_jitter: bool,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Consecutive protocol errors before the connection escalates as fatal
    #[serde(default = "default_protocol_error_ceiling")]
    pub protocol_error_ceiling: u32,
    /// Bounded stream-event queue between supervisors and the dispatcher
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_reconnect_base_secs() -> u64 {
    5
}

fn default_reconnect_cap_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_secs() -> u64 {
    20
}

fn default_heartbeat_timeout_secs() -> u64 {
    60
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_protocol_error_ceiling() -> u32 {
    5
}

fn default_event_queue_capacity() -> usize {
    1024
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            public_url: String::new(),
            private_url: String::new(),
            reconnect_base_secs: default_reconnect_base_secs(),
            reconnect_cap_secs: default_reconnect_cap_secs(),
            reconnect_jitter: true,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            protocol_error_ceiling: default_protocol_error_ceiling(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestConfig {
    /// REST API base URL
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_retry_cap_ms() -> u64 {
    5_000
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FundingConfig {
    /// Absolute bound on the funding rate, per hour (e.g. 0.001 = 0.1%/h)
    #[serde(default = "default_funding_bound_per_hour")]
    pub bound_per_hour: Decimal,
    #[serde(default = "default_funding_ttl_secs")]
    pub ttl_secs: u64,
    /// Entries older than this are evicted outright
    #[serde(default = "default_funding_evict_after_secs")]
    pub evict_after_secs: u64,
    /// Whether streamed samples are rejected or clamped when out of bounds
    #[serde(default = "default_stream_clamp")]
    pub clamp_stream_samples: bool,
}

fn default_funding_bound_per_hour() -> Decimal {
    // 0.1% per hour
    Decimal::new(1, 3)
}

fn default_funding_ttl_secs() -> u64 {
    3_600
}

fn default_funding_evict_after_secs() -> u64 {
    14_400
}

fn default_stream_clamp() -> bool {
    false
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            bound_per_hour: default_funding_bound_per_hour(),
            ttl_secs: default_funding_ttl_secs(),
            evict_after_secs: default_funding_evict_after_secs(),
            clamp_stream_samples: default_stream_clamp(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceConfig {
    #[serde(default = "default_balance_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_balance_ttl_secs() -> u64 {
    30
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_balance_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrdersConfig {
    /// How long terminal orders stay queryable before eviction
    #[serde(default = "default_terminal_grace_secs")]
    pub terminal_grace_secs: u64,
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
}

fn default_terminal_grace_secs() -> u64 {
    300
}

fn default_eviction_interval_secs() -> u64 {
    60
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            terminal_grace_secs: default_terminal_grace_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ConnectivityConfig {
    /// Load from an optional file layered under `LANYARD_*` environment
    /// overrides (e.g. `LANYARD_STREAM__PUBLIC_URL`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("LANYARD").separator("__"))
            .build()?;
        let config: ConnectivityConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.governor.backoff_base_secs == 0 {
            return Err(crate::error::LanyardError::Validation(
                "governor.backoff_base_secs must be positive".to_string(),
            ));
        }
        if self.stream.heartbeat_timeout_secs < self.stream.heartbeat_interval_secs {
            return Err(crate::error::LanyardError::Validation(
                "stream.heartbeat_timeout_secs must be at least the heartbeat interval"
                    .to_string(),
            ));
        }
        if self.funding.bound_per_hour <= Decimal::ZERO {
            return Err(crate::error::LanyardError::Validation(
                "funding.bound_per_hour must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            governor: GovernorConfig::default(),
            stream: StreamConfig::default(),
            rest: RestConfig::default(),
            funding: FundingConfig::default(),
            balance: BalanceConfig::default(),
            orders: OrdersConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
