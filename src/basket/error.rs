use broker_framework::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum BasketError {
    #[error("Basket store error: {0}")]
    Store(String),
    #[error("Basket serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid basket: {0}")]
    Invalid(String),
}

impl From<redis::RedisError> for BasketError {
    fn from(e: redis::RedisError) -> Self {
        BasketError::Store(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("No basket found for buyer {0}")]
    BasketNotFound(String),
    #[error("Invalid checkout: {0}")]
    Invalid(String),
    #[error("Failed to publish checkout: {0}")]
    Publish(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] BasketError),
}
