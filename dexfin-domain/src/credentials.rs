//! Exchange Credentials
//!
//! API key pair used to sign private requests.
//!
//! # Security Model
//!
//! - The secret lives in a `Zeroizing` buffer and is wiped on drop
//! - `Debug` never prints the secret
//! - Credentials are immutable for the lifetime of a connector session

use std::fmt;

use zeroize::{Zeroize, Zeroizing};

/// Decrypted API credentials (in-memory only, never persisted).
///
/// This struct contains the plaintext credentials and should:
/// - Never be logged
/// - Never be serialized to disk
/// - Be zeroized when dropped
pub struct ApiCredentials {
    api_key: String,
    api_secret: Zeroizing<String>,
}

impl ApiCredentials {
    /// Create new API credentials.
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: Zeroizing::new(api_secret.into()),
        }
    }

    /// Public key identifier, sent as `X-Auth-Apikey`.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Secret used as the MAC key. Never send or log this.
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }

    /// Whether both halves are present.
    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

impl Zeroize for ApiCredentials {
    fn zeroize(&mut self) {
        self.api_key.zeroize();
        self.api_secret.zeroize();
    }
}

impl Drop for ApiCredentials {
    fn drop(&mut self) {
        self.zeroize();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secret() {
        let creds = ApiCredentials::new("6d999b5beaa58452", "super_secret");
        let printed = format!("{:?}", creds);

        assert!(printed.contains("6d999b5beaa58452"));
        assert!(!printed.contains("super_secret"));
    }

    #[test]
    fn test_api_credentials_zeroize() {
        let mut creds = ApiCredentials::new("test_key", "test_secret");

        assert_eq!(creds.api_key(), "test_key");
        assert_eq!(creds.api_secret(), "test_secret");

        creds.zeroize();

        assert!(creds.api_key().is_empty());
        assert!(creds.api_secret().is_empty());
    }

    #[test]
    fn test_is_complete() {
        assert!(ApiCredentials::new("k", "s").is_complete());
        assert!(!ApiCredentials::new("", "s").is_complete());
        assert!(!ApiCredentials::new("k", "").is_complete());
    }
}
