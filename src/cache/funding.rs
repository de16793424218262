//! Validated, time-bounded funding-rate cache.
//!
//! Ingestion bounds-checks every sample against a configured per-hour limit
//! scaled to the sample's funding interval. The policy is chosen per
//! ingestion path: reject where the value feeds a real financial decision,
//! clamp where a continuous estimate is enough for display.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::coordination::ShutdownToken;
use crate::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::domain::FundingRateSample;
use crate::error::LanyardError;
use crate::exchange::Clock;

const SECS_PER_HOUR: u64 = 3600;

/// What to do with an out-of-bounds sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundPolicy {
    /// Drop the sample and leave the prior cached value untouched
    Reject,
    /// Store the bound-limited value
    Clamp,
}

/// Result of one ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    Clamped(Decimal),
    Rejected,
    /// Shutdown had begun; no cache write happened
    Dropped,
}

/// A cached rate as seen by the caller. A stale reading still carries the
/// last value; whether to refetch is the caller's decision.
#[derive(Debug, Clone)]
pub enum RateReading {
    Fresh(FundingRateSample),
    Stale(FundingRateSample),
}

impl RateReading {
    pub fn sample(&self) -> &FundingRateSample {
        match self {
            RateReading::Fresh(s) | RateReading::Stale(s) => s,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, RateReading::Stale(_))
    }
}

struct StoredSample {
    sample: FundingRateSample,
    ingested_at: Instant,
}

/// Caches validated funding-rate samples with TTL-based staleness.
pub struct FundingRateCache {
    entries: DashMap<String, StoredSample>,
    /// Absolute bound on the rate, expressed per hour
    bound_per_hour: Decimal,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownToken,
    diagnostics: Diagnostics,
}

impl FundingRateCache {
    pub fn new(
        bound_per_hour: Decimal,
        ttl: Duration,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownToken,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            bound_per_hour,
            ttl,
            clock,
            shutdown,
            diagnostics,
        }
    }

    /// Bound scaled to this sample's funding interval.
    fn scaled_bound(&self, interval: Duration) -> Result<Decimal, LanyardError> {
        if interval.is_zero() {
            return Err(LanyardError::Validation(
                "funding interval must be positive".to_string(),
            ));
        }
        Ok(self.bound_per_hour * Decimal::from(interval.as_secs()) / Decimal::from(SECS_PER_HOUR))
    }

    /// Validate and cache one sample under the given policy.
    pub fn ingest(&self, sample: FundingRateSample, policy: BoundPolicy) -> IngestOutcome {
        if self.shutdown.is_shutdown() {
            self.diagnostics.emit(DiagnosticEvent::WriteAfterShutdown {
                component: "funding-rate-cache",
            });
            return IngestOutcome::Dropped;
        }

        let bound = match self.scaled_bound(sample.interval) {
            Ok(bound) => bound,
            Err(_) => {
                warn!(symbol = %sample.symbol, "sample with zero funding interval rejected");
                self.diagnostics.emit(DiagnosticEvent::FundingRejected {
                    symbol: sample.symbol.clone(),
                    rate: sample.rate,
                    bound: Decimal::ZERO,
                });
                return IngestOutcome::Rejected;
            }
        };

        if sample.rate.abs() <= bound {
            debug!(symbol = %sample.symbol, rate = %sample.rate, "funding rate cached");
            self.store(sample);
            return IngestOutcome::Stored;
        }

        match policy {
            BoundPolicy::Reject => {
                warn!(
                    symbol = %sample.symbol,
                    rate = %sample.rate,
                    %bound,
                    "funding rate out of bounds, rejected"
                );
                self.diagnostics.emit(DiagnosticEvent::FundingRejected {
                    symbol: sample.symbol.clone(),
                    rate: sample.rate,
                    bound,
                });
                IngestOutcome::Rejected
            }
            BoundPolicy::Clamp => {
                let clamped = if sample.rate.is_sign_negative() {
                    -bound
                } else {
                    bound
                };
                self.diagnostics.emit(DiagnosticEvent::FundingClamped {
                    symbol: sample.symbol.clone(),
                    raw: sample.rate,
                    clamped,
                });
                let mut sample = sample;
                sample.rate = clamped;
                self.store(sample);
                IngestOutcome::Clamped(clamped)
            }
        }
    }

    fn store(&self, sample: FundingRateSample) {
        self.entries.insert(
            sample.symbol.clone(),
            StoredSample {
                sample,
                ingested_at: self.clock.now(),
            },
        );
    }

    /// Last cached rate, flagged stale once older than the TTL.
    pub fn get(&self, symbol: &str) -> Option<RateReading> {
        let entry = self.entries.get(symbol)?;
        let age = self.clock.now().duration_since(entry.ingested_at);
        let sample = entry.sample.clone();
        if age < self.ttl {
            Some(RateReading::Fresh(sample))
        } else {
            Some(RateReading::Stale(sample))
        }
    }

    /// Drop entries older than `max_age`. Returns how many were evicted.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, stored| now.duration_since(stored.ingested_at) <= max_age);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
