//! Request signing seam and the reference HMAC signer.
//!
//! The core only ever talks to the `Signer` trait; the bundled
//! implementation covers the common HMAC-SHA256 scheme (timestamp + api key
//! + receive window + payload, hex digest) so a connector without bespoke
//! auth needs no extra code.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{LanyardError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Default receive window: the server rejects signed requests whose
/// timestamp deviates more than this from its own clock.
pub const DEFAULT_RECV_WINDOW_MS: i64 = 5_000;

/// The request parts a signature covers.
#[derive(Debug, Clone)]
pub struct SignRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// Canonical query string, empty for body-carrying requests
    pub query: &'a str,
    /// Serialized body, empty for GETs
    pub body: &'a str,
    /// Wall-clock milliseconds, must fall inside the receive window
    pub timestamp_ms: i64,
}

/// Produces exchange-required authentication headers for one request.
pub trait Signer: Send + Sync {
    /// Headers to attach: signature, timestamp, key id, signature type.
    fn sign(&self, request: &SignRequest<'_>) -> Result<Vec<(String, String)>>;

    /// Allowed clock skew between the signed timestamp and the server.
    fn receive_window_ms(&self) -> i64 {
        DEFAULT_RECV_WINDOW_MS
    }

    /// Key id for auth frames on private streams.
    fn api_key(&self) -> &str;
}

/// API credentials; the secret is wiped from memory on drop.
pub struct ApiCredentials {
    pub api_key: String,
    secret: Zeroizing<String>,
}

impl ApiCredentials {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }

    fn secret_bytes(&self) -> &[u8] {
        self.secret.as_bytes()
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// HMAC-SHA256 signer.
///
/// Signature string: `{timestamp}{api_key}{recv_window}{payload}` where the
/// payload is the canonical query string for GETs and the serialized body
/// otherwise, hex-digested with the API secret as key.
pub struct HmacSigner {
    credentials: ApiCredentials,
    recv_window_ms: i64,
}

impl HmacSigner {
    pub fn new(credentials: ApiCredentials) -> Self {
        Self {
            credentials,
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
        }
    }

    pub fn with_recv_window(mut self, recv_window_ms: i64) -> Self {
        self.recv_window_ms = recv_window_ms;
        self
    }
}

impl Signer for HmacSigner {
    fn sign(&self, request: &SignRequest<'_>) -> Result<Vec<(String, String)>> {
        let payload = if request.body.is_empty() {
            request.query
        } else {
            request.body
        };
        let sign_str = format!(
            "{}{}{}{}",
            request.timestamp_ms, self.credentials.api_key, self.recv_window_ms, payload
        );

        let mut mac = HmacSha256::new_from_slice(self.credentials.secret_bytes())
            .map_err(|e| LanyardError::Signature(format!("invalid API secret: {}", e)))?;
        mac.update(sign_str.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(vec![
            ("X-API-KEY".to_string(), self.credentials.api_key.clone()),
            (
                "X-API-TIMESTAMP".to_string(),
                request.timestamp_ms.to_string(),
            ),
            (
                "X-API-RECV-WINDOW".to_string(),
                self.recv_window_ms.to_string(),
            ),
            ("X-API-SIGN-TYPE".to_string(), "2".to_string()),
            ("X-API-SIGN".to_string(), signature),
        ])
    }

    fn receive_window_ms(&self) -> i64 {
        self.recv_window_ms
    }

    fn api_key(&self) -> &str {
        &self.credentials.api_key
    }
}
