//! Connector error taxonomy.

use dexfin_domain::DomainError;
use thiserror::Error;

/// Errors surfaced by the REST pipeline, the symbol map and the connector session.
///
/// None of these are fatal: every variant is reported to the caller, which owns
/// the retry policy.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    /// Network or HTTP-level failure (including timeouts, where `status` is `None`)
    #[error("Transport error (status {}): {body}", .status.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string()))]
    Transport {
        /// HTTP status, if a response was received
        status: Option<u16>,
        /// Raw response body or transport failure description
        body: String,
    },

    /// Well-formed error payload returned by the exchange
    #[error("Exchange error: {code} - {message}")]
    Exchange {
        /// Exchange error code
        code: String,
        /// Exchange error message
        message: String,
    },

    /// Signature or nonce rejected, usually a symptom of clock skew
    #[error("Authentication rejected: {code} - {message}")]
    Authentication {
        /// Exchange error code (or HTTP status text)
        code: String,
        /// Exchange error message
        message: String,
    },

    /// Instrument absent from the symbol map
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Rate-limit table lookup or validation failure
    #[error("Rate limit configuration error: {0}")]
    RateLimit(String),

    /// Failed to build request signature
    #[error("Failed to build signature: {0}")]
    Signature(String),

    /// Failed to parse a response
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Invalid connector configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Domain validation failed
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// The exchange accepted the order but its response could not be mapped.
    /// The order exists; retrying would place a duplicate.
    #[error("Order {exchange_order_id} accepted but not mapped: {reason}")]
    UnmappedOrder {
        /// Exchange order id from the acceptance response
        exchange_order_id: String,
        /// Mapping failure
        reason: String,
    },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,
}

impl ConnectorError {
    /// Build a transport error from a status and raw body.
    pub fn transport(status: Option<u16>, body: impl Into<String>) -> Self {
        ConnectorError::Transport {
            status,
            body: body.into(),
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ConnectorError::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Exchange order id of an order that exists despite the error.
    pub fn exchange_order_id(&self) -> Option<&str> {
        match self {
            ConnectorError::UnmappedOrder {
                exchange_order_id, ..
            } => Some(exchange_order_id),
            _ => None,
        }
    }

    /// Whether the exchange reported the market as nonexistent.
    ///
    /// Such errors mean the symbol map is out of date and should be refreshed.
    pub fn is_unknown_market(&self) -> bool {
        match self {
            ConnectorError::UnknownSymbol(_) => true,
            ConnectorError::Exchange { code, .. } => {
                code.ends_with("market.doesnt_exist") || code.ends_with("market.invalid_market")
            }
            _ => false,
        }
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;
