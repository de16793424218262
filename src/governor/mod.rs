//! Per-endpoint rate governance.
//!
//! One token-bucket budget per REST endpoint group. Callers acquire a permit
//! before every outbound call; when the budget is exhausted or a server-side
//! rate-limit signal has opened a backoff window, the caller is queued until
//! the window passes, bounded by an optional deadline.

pub mod backoff;

pub use backoff::{jittered, Backoff};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::domain::{Endpoint, RateLimit};
use crate::error::{LanyardError, Result};

/// Default base delay applied on the first server-side rate-limit signal
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

/// Hard cap on any backoff window
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Admission receipt for one weighted call.
///
/// The weight is consumed at admission and not returned on drop: a completed
/// call still counts against the rolling window, unlike a semaphore permit.
#[derive(Debug)]
#[must_use = "acquiring a permit without sending the call wastes budget"]
pub struct Permit {
    endpoint: Endpoint,
    weight: u32,
}

impl Permit {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

/// Read-only view of one endpoint's budget, for monitoring.
#[derive(Debug, Clone)]
pub struct BudgetSnapshot {
    pub endpoint: Endpoint,
    pub remaining: u32,
    pub capacity: u32,
    pub window_resets_in: Duration,
    pub backoff_remaining: Option<Duration>,
}

/// Per-endpoint budget state. Mutated only under its own lock; no global
/// lock serializes unrelated endpoints.
struct EndpointState {
    limit: RateLimit,
    remaining: u32,
    window_reset: Instant,
    backoff: Backoff,
    backoff_until: Option<Instant>,
}

impl EndpointState {
    fn new(limit: RateLimit, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            limit,
            remaining: limit.capacity,
            window_reset: Instant::now() + limit.window,
            backoff: Backoff::new(backoff_base, backoff_cap),
            backoff_until: None,
        }
    }

    /// Roll the window forward if it has elapsed.
    fn refill_if_due(&mut self, now: Instant) {
        if now >= self.window_reset {
            self.remaining = self.limit.capacity;
            self.window_reset = now + self.limit.window;
        }
    }
}

/// Tracks remaining request budget per endpoint group and queues or delays
/// callers to respect both local limits and server-side backoff windows.
pub struct RateGovernor {
    states: DashMap<Endpoint, Arc<Mutex<EndpointState>>>,
    backoff_base: Duration,
    backoff_cap: Duration,
    diagnostics: Diagnostics,
}

impl RateGovernor {
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self::with_backoff(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, diagnostics)
    }

    pub fn with_backoff(base: Duration, cap: Duration, diagnostics: Diagnostics) -> Self {
        Self {
            states: DashMap::new(),
            backoff_base: base,
            backoff_cap: cap,
            diagnostics,
        }
    }

    /// Override the documented limit for one endpoint (config-driven).
    pub fn set_limit(&self, endpoint: Endpoint, limit: RateLimit) {
        let state = Arc::new(Mutex::new(EndpointState::new(
            limit,
            self.backoff_base,
            self.backoff_cap,
        )));
        self.states.insert(endpoint, state);
    }

    fn state_for(&self, endpoint: Endpoint) -> Arc<Mutex<EndpointState>> {
        self.states
            .entry(endpoint)
            .or_insert_with(|| {
                Arc::new(Mutex::new(EndpointState::new(
                    endpoint.default_limit(),
                    self.backoff_base,
                    self.backoff_cap,
                )))
            })
            .clone()
    }

    /// Acquire budget for one weighted call, suspending until admitted.
    pub async fn acquire(&self, endpoint: Endpoint, weight: u32) -> Result<Permit> {
        self.acquire_inner(endpoint, weight, None).await
    }

    /// Acquire with a deadline; fails with `Timeout` if it elapses while the
    /// caller is still queued.
    pub async fn acquire_with_deadline(
        &self,
        endpoint: Endpoint,
        weight: u32,
        deadline: Instant,
    ) -> Result<Permit> {
        self.acquire_inner(endpoint, weight, Some(deadline)).await
    }

    async fn acquire_inner(
        &self,
        endpoint: Endpoint,
        weight: u32,
        deadline: Option<Instant>,
    ) -> Result<Permit> {
        let state = self.state_for(endpoint);

        {
            let guard = state.lock().await;
            if weight > guard.limit.capacity {
                return Err(LanyardError::Validation(format!(
                    "weight {} exceeds {} capacity {}",
                    weight, endpoint, guard.limit.capacity
                )));
            }
        }

        loop {
            let wake_at = {
                let mut guard = state.lock().await;
                let now = Instant::now();
                guard.refill_if_due(now);

                if let Some(until) = guard.backoff_until {
                    if now >= until {
                        guard.backoff_until = None;
                    }
                }

                match guard.backoff_until {
                    None if weight <= guard.remaining => {
                        guard.remaining -= weight;
                        return Ok(Permit { endpoint, weight });
                    }
                    // Budget exhausted: the earliest useful wake-up is the
                    // window rollover.
                    None => guard.window_reset,
                    // Backoff active: nothing can be admitted before it ends.
                    Some(until) => until.max(now),
                }
            };

            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    debug!(%endpoint, "deadline elapsed while queued");
                    return Err(LanyardError::Timeout(format!(
                        "deadline elapsed while queued for {}",
                        endpoint
                    )));
                }
                tokio::time::sleep_until(wake_at.min(deadline)).await;
            } else {
                tokio::time::sleep_until(wake_at).await;
            }
        }
    }

    /// Record a server-side rate-limit response for this endpoint despite
    /// local admission (clock skew, shared IP). Opens or widens the backoff
    /// window; subsequent acquires queue until it passes.
    pub async fn report_rate_limited(&self, endpoint: Endpoint) {
        let state = self.state_for(endpoint);
        let mut guard = state.lock().await;

        guard.backoff.advance();
        let delay = guard.backoff.peek();
        guard.backoff_until = Some(Instant::now() + delay);

        warn!(
            %endpoint,
            attempts = guard.backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "server-side rate limit, backing off"
        );
        self.diagnostics.emit(DiagnosticEvent::RateLimitBackoff {
            endpoint,
            attempts: guard.backoff.attempts(),
            delay_ms: delay.as_millis() as u64,
        });
    }

    /// Record a successful call: resets the consecutive rate-limit counter
    /// and clears any remaining backoff window.
    pub async fn report_success(&self, endpoint: Endpoint) {
        let state = self.state_for(endpoint);
        let mut guard = state.lock().await;
        guard.backoff.reset();
        guard.backoff_until = None;
    }

    /// Current backoff window for an endpoint, if one is active.
    pub async fn backoff_remaining(&self, endpoint: Endpoint) -> Option<Duration> {
        let state = self.state_for(endpoint);
        let guard = state.lock().await;
        let until = guard.backoff_until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    /// Read-only budget view for monitoring.
    pub async fn snapshot(&self, endpoint: Endpoint) -> BudgetSnapshot {
        let state = self.state_for(endpoint);
        let guard = state.lock().await;
        let now = Instant::now();
        BudgetSnapshot {
            endpoint,
            remaining: guard.remaining,
            capacity: guard.limit.capacity,
            window_resets_in: guard.window_reset.saturating_duration_since(now),
            backoff_remaining: guard
                .backoff_until
                .and_then(|until| (until > now).then(|| until - now)),
        }
    }
}
