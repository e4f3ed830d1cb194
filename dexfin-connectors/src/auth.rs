//! Request signing for private endpoints.
//!
//! # Authentication
//!
//! Every private request carries three headers:
//! - `X-Auth-Apikey`: the public key identifier
//! - `X-Auth-Nonce`: synchronized exchange time in whole seconds
//! - `X-Auth-Signature`: lowercase hex HMAC-SHA256 keyed by the secret over
//!   `nonce || api_key`
//!
//! The exchange rejects nonces older than the last one it accepted, so the
//! nonce comes from the synchronized clock and never goes backwards.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dexfin_domain::ApiCredentials;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::clock::ClockSynchronizer;
use crate::error::{ConnectorError, ConnectorResult};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the public key.
pub const API_KEY_HEADER: &str = "X-Auth-Apikey";
/// Header carrying the nonce.
pub const NONCE_HEADER: &str = "X-Auth-Nonce";
/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-Auth-Signature";

/// Authentication headers for one request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// Public key identifier
    pub api_key: String,
    /// Nonce (integer seconds)
    pub nonce: String,
    /// Hex-encoded MAC
    pub signature: String,
}

impl SignedHeaders {
    /// Header name/value pairs in wire order.
    pub fn pairs(&self) -> [(&'static str, &str); 3] {
        [
            (API_KEY_HEADER, self.api_key.as_str()),
            (NONCE_HEADER, self.nonce.as_str()),
            (SIGNATURE_HEADER, self.signature.as_str()),
        ]
    }
}

/// Produces authentication headers for private requests.
pub struct RequestSigner {
    credentials: ApiCredentials,
    clock: Arc<ClockSynchronizer>,
    last_nonce: AtomicI64,
}

impl RequestSigner {
    /// Create a signer over the given credentials and clock.
    pub fn new(credentials: ApiCredentials, clock: Arc<ClockSynchronizer>) -> Self {
        Self {
            credentials,
            clock,
            last_nonce: AtomicI64::new(0),
        }
    }

    /// Public key identifier.
    pub fn api_key(&self) -> &str {
        self.credentials.api_key()
    }

    /// Compute the signature for a nonce. Pure given (credentials, nonce).
    pub fn sign(&self, nonce: &str) -> ConnectorResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret().as_bytes())
            .map_err(|e| ConnectorError::Signature(format!("HMAC error: {}", e)))?;

        mac.update(nonce.as_bytes());
        mac.update(self.credentials.api_key().as_bytes());

        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Build headers for an explicit nonce.
    pub fn headers_for_nonce(&self, nonce: i64) -> ConnectorResult<SignedHeaders> {
        let nonce = nonce.to_string();
        let signature = self.sign(&nonce)?;

        Ok(SignedHeaders {
            api_key: self.credentials.api_key().to_string(),
            nonce,
            signature,
        })
    }

    /// Build headers using the next nonce from the synchronized clock.
    pub fn headers(&self) -> ConnectorResult<SignedHeaders> {
        self.headers_for_nonce(self.next_nonce())
    }

    /// Synchronized time in seconds, clamped so it never drops below a nonce
    /// already handed out (a later clock sample may move the offset backwards).
    fn next_nonce(&self) -> i64 {
        let candidate = self.clock.current_time_secs();
        let previous = self.last_nonce.fetch_max(candidate, Ordering::AcqRel);
        previous.max(candidate)
    }
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("api_key", &self.credentials.api_key())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
