use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Where a funding-rate sample was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    Stream,
    Rest,
}

impl std::fmt::Display for RateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateSource::Stream => write!(f, "stream"),
            RateSource::Rest => write!(f, "rest"),
        }
    }
}

/// One funding-rate observation, expressed as a fraction per funding interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRateSample {
    pub symbol: String,
    /// Fraction paid per funding interval, e.g. 0.0001 = 1 bp
    pub rate: Decimal,
    /// Length of the funding interval the rate applies to
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub timestamp: DateTime<Utc>,
    pub source: RateSource,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Wallet and per-asset available balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub wallet: Decimal,
    pub available: Decimal,
    pub fetched_at: DateTime<Utc>,
}

/// A cached value with its fetch instant and TTL.
///
/// Validity is judged against the monotonic clock so that wall-clock jumps
/// never extend or shorten an entry's lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, fetched_at: Instant, ttl: Duration) -> Self {
        Self {
            value,
            fetched_at,
            ttl,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.fetched_at) < self.ttl
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.fetched_at)
    }
}
