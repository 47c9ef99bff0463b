//! Outbound email delivery for notifications.

use crate::model::Notification;
use async_trait::async_trait;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("Email delivery to {address} failed: {reason}")]
    Delivery { address: String, reason: String },
}

#[async_trait]
pub trait EmailService: Send + Sync + 'static {
    async fn send(&self, notification: &Notification) -> Result<(), EmailError>;
}

/// Writes the notification to the log instead of sending it.
#[derive(Debug, Clone, Default)]
pub struct LogEmailService;

#[async_trait]
impl EmailService for LogEmailService {
    async fn send(&self, notification: &Notification) -> Result<(), EmailError> {
        info!(
            notification_id = %notification.notification_id,
            address = %notification.address,
            content = %notification.content,
            "Email sent"
        );
        Ok(())
    }
}
