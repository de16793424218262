//! Governed, signed REST call path.
//!
//! Every outbound REST call flows through here: acquire budget from the
//! governor, sign, send, classify. Server-side rate limits feed the
//! governor's backoff and the call is requeued; transient network failures
//! retry with the shared backoff combinator; auth failures escalate
//! immediately. Business-level error codes in a 4xx body are returned to the
//! caller for the schema adapter to map.

use reqwest::header::{HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::coordination::ShutdownToken;
use crate::domain::Endpoint;
use crate::error::{LanyardError, Result};
use crate::exchange::{Clock, RestRequest, RestResponse, RestTransport};
use crate::governor::{Backoff, RateGovernor};
use crate::signing::{SignRequest, Signer};

#[derive(Debug, Clone)]
pub struct RestGatewayConfig {
    /// Transient-failure retries before giving up
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl Default for RestGatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_millis(250),
            retry_cap: Duration::from_secs(5),
        }
    }
}

pub struct RestGateway {
    governor: Arc<RateGovernor>,
    transport: Arc<dyn RestTransport>,
    signer: Option<Arc<dyn Signer>>,
    clock: Arc<dyn Clock>,
    config: RestGatewayConfig,
    shutdown: ShutdownToken,
}

impl RestGateway {
    pub fn new(
        governor: Arc<RateGovernor>,
        transport: Arc<dyn RestTransport>,
        signer: Option<Arc<dyn Signer>>,
        clock: Arc<dyn Clock>,
        config: RestGatewayConfig,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            governor,
            transport,
            signer,
            clock,
            config,
            shutdown,
        }
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    /// Execute one governed call, retrying internally until it succeeds or
    /// fails in a way the caller must see.
    pub async fn execute(
        &self,
        endpoint: Endpoint,
        weight: u32,
        request: RestRequest,
    ) -> Result<RestResponse> {
        self.execute_inner(endpoint, weight, request, None).await
    }

    /// As `execute`, but the whole call (queueing included) must finish
    /// before the deadline or it fails with `Timeout`.
    pub async fn execute_with_deadline(
        &self,
        endpoint: Endpoint,
        weight: u32,
        request: RestRequest,
        deadline: Instant,
    ) -> Result<RestResponse> {
        self.execute_inner(endpoint, weight, request, Some(deadline))
            .await
    }

    async fn execute_inner(
        &self,
        endpoint: Endpoint,
        weight: u32,
        request: RestRequest,
        deadline: Option<Instant>,
    ) -> Result<RestResponse> {
        let mut backoff = Backoff::new(self.config.retry_base, self.config.retry_cap);
        let mut transient_attempts: u32 = 0;

        loop {
            if self.shutdown.is_shutdown() {
                return Err(LanyardError::Shutdown);
            }

            let _permit = match deadline {
                Some(deadline) => {
                    self.governor
                        .acquire_with_deadline(endpoint, weight, deadline)
                        .await?
                }
                None => self.governor.acquire(endpoint, weight).await?,
            };

            let outbound = self.signed(&request)?;
            match self.transport.send(outbound).await {
                Ok(response) if response.status == 429 => {
                    // Server disagreed with our local budget (clock skew,
                    // shared IP); the governor opens a backoff window and
                    // the next acquire queues behind it.
                    warn!(%endpoint, "server-side rate limit");
                    self.governor.report_rate_limited(endpoint).await;
                }
                Ok(response) if response.status == 401 || response.status == 403 => {
                    return Err(LanyardError::Auth(format!(
                        "{} returned status {}",
                        endpoint, response.status
                    )));
                }
                Ok(response) if response.status >= 500 => {
                    let detail = format!("{} returned status {}", endpoint, response.status);
                    self.transient_pause(
                        &detail,
                        &mut transient_attempts,
                        &mut backoff,
                        deadline,
                    )
                    .await?;
                }
                Ok(response) => {
                    debug!(%endpoint, status = response.status, "rest call completed");
                    self.governor.report_success(endpoint).await;
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    let detail = e.to_string();
                    self.transient_pause(
                        &detail,
                        &mut transient_attempts,
                        &mut backoff,
                        deadline,
                    )
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait out one transient failure, honoring the retry ceiling and the
    /// caller's deadline.
    async fn transient_pause(
        &self,
        detail: &str,
        attempts: &mut u32,
        backoff: &mut Backoff,
        deadline: Option<Instant>,
    ) -> Result<()> {
        *attempts += 1;
        if *attempts > self.config.max_retries {
            return Err(LanyardError::TransientNetwork(format!(
                "giving up after {} attempts: {}",
                attempts, detail
            )));
        }

        let delay = backoff.advance();
        warn!(
            %detail,
            attempt = *attempts,
            delay_ms = delay.as_millis() as u64,
            "transient failure, retrying"
        );

        match deadline {
            Some(deadline) => {
                let wake = Instant::now() + delay;
                tokio::time::sleep_until(wake.min(deadline)).await;
                if Instant::now() >= deadline {
                    return Err(LanyardError::Timeout(format!(
                        "deadline elapsed retrying: {}",
                        detail
                    )));
                }
            }
            None => tokio::time::sleep(delay).await,
        }
        Ok(())
    }

    fn signed(&self, request: &RestRequest) -> Result<RestRequest> {
        let mut outbound = request.clone();
        if let Some(signer) = &self.signer {
            let query = outbound.canonical_query();
            let body = outbound.canonical_body();
            let sign_request = SignRequest {
                method: outbound.method.as_str(),
                path: &outbound.path,
                query: &query,
                body: &body,
                timestamp_ms: self.clock.wall().timestamp_millis(),
            };
            for (name, value) in signer.sign(&sign_request)? {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| LanyardError::Signature(format!("bad header name: {}", e)))?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| LanyardError::Signature(format!("bad header value: {}", e)))?;
                outbound.headers.insert(name, value);
            }
        }
        Ok(outbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ShutdownController;
    use crate::diagnostics::Diagnostics;
    use crate::exchange::{MockRestTransport, SystemClock};
    use crate::signing::{ApiCredentials, HmacSigner};

    fn response(status: u16) -> RestResponse {
        RestResponse {
            status,
            body: serde_json::json!({}),
        }
    }

    fn gateway(transport: MockRestTransport) -> (RestGateway, ShutdownController) {
        let diagnostics = Diagnostics::default();
        let (controller, token) = ShutdownController::new();
        (
            RestGateway::new(
                Arc::new(RateGovernor::new(diagnostics)),
                Arc::new(transport),
                None,
                Arc::new(SystemClock),
                RestGatewayConfig {
                    max_retries: 2,
                    retry_base: Duration::from_millis(10),
                    retry_cap: Duration::from_millis(50),
                },
                token,
            ),
            controller,
        )
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let mut transport = MockRestTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(response(200)));

        let (gateway, _c) = gateway(transport);
        let out = gateway
            .execute(Endpoint::OrderStatus, 1, RestRequest::get("/order"))
            .await
            .unwrap();
        assert_eq!(out.status, 200);
    }

    #[tokio::test]
    async fn test_auth_status_is_fatal() {
        let mut transport = MockRestTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(response(401)));

        let (gateway, _c) = gateway(transport);
        let err = gateway
            .execute(Endpoint::OrderStatus, 1, RestRequest::get("/order"))
            .await
            .unwrap_err();
        assert!(matches!(err, LanyardError::Auth(_)));
    }

    #[tokio::test]
    async fn test_server_errors_retry_then_give_up() {
        let mut transport = MockRestTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_| Ok(response(503)));

        let (gateway, _c) = gateway(transport);
        let err = gateway
            .execute(Endpoint::OrderStatus, 1, RestRequest::get("/order"))
            .await
            .unwrap_err();
        assert!(matches!(err, LanyardError::TransientNetwork(_)));
    }

    #[tokio::test]
    async fn test_rate_limited_then_succeeds() {
        tokio::time::pause();
        let mut transport = MockRestTransport::new();
        let mut first = true;
        transport.expect_send().times(2).returning(move |_| {
            if first {
                first = false;
                Ok(response(429))
            } else {
                Ok(response(200))
            }
        });

        let (gateway, _c) = gateway(transport);
        let out = gateway
            .execute(Endpoint::PlaceOrder, 1, RestRequest::get("/order"))
            .await
            .unwrap();
        assert_eq!(out.status, 200);

        // The success reset the endpoint's backoff counter.
        assert!(gateway
            .governor()
            .backoff_remaining(Endpoint::PlaceOrder)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_business_error_returned_to_caller() {
        let mut transport = MockRestTransport::new();
        transport.expect_send().times(1).returning(|_| {
            Ok(RestResponse {
                status: 400,
                body: serde_json::json!({"retCode": 10001, "retMsg": "invalid symbol"}),
            })
        });

        let (gateway, _c) = gateway(transport);
        let out = gateway
            .execute(Endpoint::PlaceOrder, 1, RestRequest::get("/order"))
            .await
            .unwrap();
        assert_eq!(out.status, 400);
        assert_eq!(out.body["retMsg"], "invalid symbol");
    }

    #[tokio::test]
    async fn test_shutdown_fails_fast() {
        let transport = MockRestTransport::new();
        let (gateway, controller) = gateway(transport);
        controller.trigger();

        let err = gateway
            .execute(Endpoint::PlaceOrder, 1, RestRequest::get("/order"))
            .await
            .unwrap_err();
        assert!(matches!(err, LanyardError::Shutdown));
    }

    #[tokio::test]
    async fn test_signed_request_carries_auth_headers() {
        let mut transport = MockRestTransport::new();
        transport.expect_send().times(1).returning(|request| {
            assert!(request.headers.contains_key("x-api-key"));
            assert!(request.headers.contains_key("x-api-sign"));
            Ok(response(200))
        });

        let diagnostics = Diagnostics::default();
        let (_controller, token) = ShutdownController::new();
        let signer = HmacSigner::new(ApiCredentials::new("key", "secret"));
        let gateway = RestGateway::new(
            Arc::new(RateGovernor::new(diagnostics)),
            Arc::new(transport),
            Some(Arc::new(signer)),
            Arc::new(SystemClock),
            RestGatewayConfig::default(),
            token,
        );

        gateway
            .execute(
                Endpoint::WalletBalance,
                1,
                RestRequest::get("/v5/account/wallet-balance").with_query("coin", "USDT"),
            )
            .await
            .unwrap();
    }
}
