//! # Broker Errors
//!
//! Common error type for everything that talks to a broker: connecting, publishing,
//! subscribing, settling deliveries and encoding envelopes.

/// Errors that can occur within the broker framework itself.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Invalid broker configuration: {0}")]
    InvalidConfig(String),
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Connection retries exhausted after {attempts} attempts: {last_error}")]
    ConnectExhausted { attempts: u32, last_error: String },
    #[error("Publish failed: {0}")]
    Publish(String),
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
    #[error("Settling delivery failed: {0}")]
    Settle(String),
    #[error("Unknown queue: {0:?}")]
    UnknownQueue(String),
    #[error("Transport closed")]
    Closed,
    #[error("Invalid dispatcher state: {0}")]
    InvalidState(String),
    #[error("Envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl BrokerError {
    /// Whether retrying the same connect call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::ConnectFailed(_) | BrokerError::Publish(_))
    }
}
