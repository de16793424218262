//! TTL-based balance cache with request coalescing.
//!
//! Absorbs bursty callers in front of a strictly budgeted REST endpoint:
//! within the TTL every `get` is served from memory, and concurrent callers
//! during a refresh share the single in-flight fetch instead of issuing
//! duplicate calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::coordination::ShutdownToken;
use crate::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::domain::{Balance, CacheEntry, Endpoint};
use crate::error::{LanyardError, Result};
use crate::exchange::{BalanceSource, Clock};
use crate::governor::RateGovernor;

/// Weight of one wallet-balance call against the endpoint budget
const BALANCE_CALL_WEIGHT: u32 = 1;

type FetchResult = std::result::Result<Balance, String>;

struct AssetSlot {
    entry: Option<CacheEntry<Balance>>,
    inflight: Option<watch::Receiver<Option<FetchResult>>>,
}

impl AssetSlot {
    fn empty() -> Self {
        Self {
            entry: None,
            inflight: None,
        }
    }
}

enum Plan {
    Hit(Balance),
    Join(watch::Receiver<Option<FetchResult>>),
    Fetch(watch::Sender<Option<FetchResult>>),
}

/// TTL cache of wallet and per-asset available balance.
pub struct BalanceCache {
    slots: Mutex<HashMap<String, AssetSlot>>,
    governor: Arc<RateGovernor>,
    source: Arc<dyn BalanceSource>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownToken,
    diagnostics: Diagnostics,
}

impl BalanceCache {
    pub fn new(
        governor: Arc<RateGovernor>,
        source: Arc<dyn BalanceSource>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownToken,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            governor,
            source,
            ttl,
            clock,
            shutdown,
            diagnostics,
        }
    }

    /// Cached balance, fetching through the governor on miss or expiry.
    pub async fn get(&self, asset: &str) -> Result<Balance> {
        self.get_refresh(asset, false).await
    }

    /// As `get`, but `force` bypasses a fresh cache entry. A forced caller
    /// still joins an already in-flight fetch rather than adding a call.
    pub async fn get_refresh(&self, asset: &str, force: bool) -> Result<Balance> {
        loop {
            let plan = {
                let mut slots = self.slots.lock().await;
                let slot = slots
                    .entry(asset.to_string())
                    .or_insert_with(AssetSlot::empty);

                if let Some(rx) = &slot.inflight {
                    Plan::Join(rx.clone())
                } else {
                    match &slot.entry {
                        Some(entry) if !force && entry.is_fresh(self.clock.now()) => {
                            Plan::Hit(entry.value.clone())
                        }
                        _ => {
                            let (tx, rx) = watch::channel(None);
                            slot.inflight = Some(rx);
                            Plan::Fetch(tx)
                        }
                    }
                }
            };

            match plan {
                Plan::Hit(balance) => return Ok(balance),
                Plan::Join(mut rx) => {
                    debug!(asset, "joining in-flight balance fetch");
                    // A dropped sender means the fetching task went away;
                    // loop around and fetch ourselves.
                    if rx.changed().await.is_err() {
                        continue;
                    }
                    let result = rx.borrow().clone();
                    match result {
                        Some(Ok(balance)) => return Ok(balance),
                        Some(Err(message)) => {
                            return Err(LanyardError::TransientNetwork(format!(
                                "coalesced balance fetch failed: {}",
                                message
                            )))
                        }
                        None => continue,
                    }
                }
                Plan::Fetch(tx) => return self.fetch(asset, tx).await,
            }
        }
    }

    async fn fetch(
        &self,
        asset: &str,
        tx: watch::Sender<Option<FetchResult>>,
    ) -> Result<Balance> {
        let result = self.fetch_inner(asset).await;

        {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .entry(asset.to_string())
                .or_insert_with(AssetSlot::empty);
            slot.inflight = None;

            match &result {
                Ok(balance) => {
                    if self.shutdown.is_shutdown() {
                        self.diagnostics.emit(DiagnosticEvent::WriteAfterShutdown {
                            component: "balance-cache",
                        });
                    } else {
                        slot.entry = Some(CacheEntry::new(
                            balance.clone(),
                            self.clock.now(),
                            self.ttl,
                        ));
                    }
                }
                Err(e) => {
                    warn!(asset, error = %e, "balance fetch failed");
                }
            }
        }

        let shared = match &result {
            Ok(balance) => Ok(balance.clone()),
            Err(e) => Err(e.to_string()),
        };
        let _ = tx.send(Some(shared));

        result
    }

    async fn fetch_inner(&self, asset: &str) -> Result<Balance> {
        if self.shutdown.is_shutdown() {
            return Err(LanyardError::Shutdown);
        }
        let _permit = self
            .governor
            .acquire(Endpoint::WalletBalance, BALANCE_CALL_WEIGHT)
            .await?;
        self.source.fetch_balance(asset).await
    }

    /// Drop every cached entry (not the in-flight markers).
    pub async fn clear(&self) {
        let mut slots = self.slots.lock().await;
        for slot in slots.values_mut() {
            slot.entry = None;
        }
    }
}
