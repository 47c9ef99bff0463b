use broker_framework::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum PublishOrderError {
    #[error("Invalid order: {0}")]
    Validation(String),
    #[error("Failed to publish order: {0}")]
    Publish(#[from] BrokerError),
}
