//! Order enums and the exchange's order-state table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::DomainError;

/// Order types supported by the exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Limit order (price guaranteed)
    Limit,
    /// Market order (immediate execution)
    Market,
}

impl OrderType {
    /// Wire representation (`ord_type`).
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

impl FromStr for OrderType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "limit" => Ok(OrderType::Limit),
            "market" => Ok(OrderType::Market),
            other => Err(DomainError::InvalidOrderType(other.to_string())),
        }
    }
}

/// Order lifecycle as seen by the calling engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderState {
    /// Accepted but not yet on the book
    PendingCreate,
    /// Resting on the book (possibly partially filled)
    Open,
    /// Completely filled
    Filled,
    /// Cancelled
    Canceled,
    /// Rejected by the exchange
    Failed,
}

impl OrderState {
    /// Map an exchange state string. Unknown states are an error, never a default.
    ///
    /// | wire      | state           |
    /// |-----------|-----------------|
    /// | `pending` | `PendingCreate` |
    /// | `wait`    | `Open`          |
    /// | `done`    | `Filled`        |
    /// | `cancel`  | `Canceled`      |
    /// | `reject`  | `Failed`        |
    pub fn from_exchange(state: &str) -> Result<Self, DomainError> {
        match state {
            "pending" => Ok(OrderState::PendingCreate),
            "wait" => Ok(OrderState::Open),
            "done" => Ok(OrderState::Filled),
            "cancel" => Ok(OrderState::Canceled),
            "reject" => Ok(OrderState::Failed),
            other => Err(DomainError::UnknownOrderState(other.to_string())),
        }
    }

    /// Whether no further updates are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Canceled | OrderState::Failed)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderState::PendingCreate => "PENDING_CREATE",
            OrderState::Open => "OPEN",
            OrderState::Filled => "FILLED",
            OrderState::Canceled => "CANCELED",
            OrderState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_state_table() {
        assert_eq!(OrderState::from_exchange("wait").unwrap(), OrderState::Open);
        assert_eq!(OrderState::from_exchange("done").unwrap(), OrderState::Filled);
        assert_eq!(OrderState::from_exchange("cancel").unwrap(), OrderState::Canceled);
        assert_eq!(OrderState::from_exchange("pending").unwrap(), OrderState::PendingCreate);
        assert_eq!(OrderState::from_exchange("reject").unwrap(), OrderState::Failed);
    }

    #[test]
    fn test_unknown_order_state_rejected() {
        assert_eq!(
            OrderState::from_exchange("PARTIALLY_FILLED"),
            Err(DomainError::UnknownOrderState("PARTIALLY_FILLED".to_string()))
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Canceled.is_terminal());
        assert!(!OrderState::Open.is_terminal());
        assert!(!OrderState::PendingCreate.is_terminal());
    }

    #[test]
    fn test_order_type_round_trip() {
        assert_eq!("limit".parse::<OrderType>().unwrap(), OrderType::Limit);
        assert_eq!(OrderType::Market.as_str(), "market");
        assert!("stop".parse::<OrderType>().is_err());
    }
}
