//! # Order Consumer
//!
//! Handles [`OrderCommand`]s from the order queue by sending an order confirmation
//! through the [`EmailService`].
//!
//! An email failure is returned as an error so the dispatcher nacks the delivery and
//! the broker redelivers it. The same order may therefore produce more than one email.

use super::email::{EmailError, EmailService};
use crate::model::{Notification, OrderCommand};
use async_trait::async_trait;
use broker_framework::{HandlerContext, MessageHandler};
use std::sync::Arc;
use tracing::{debug, info};

/// Address used for order confirmations until orders carry a customer address.
pub const DEFAULT_NOTIFICATION_ADDRESS: &str = "orders@localhost";

#[derive(Debug, thiserror::Error)]
pub enum OrderConsumerError {
    #[error("Unable to send email for order {order_number}: {source}")]
    Email {
        order_number: String,
        #[source]
        source: EmailError,
    },
}

pub struct OrderConsumer<E: EmailService> {
    email: Arc<E>,
    address: String,
}

impl<E: EmailService> OrderConsumer<E> {
    pub fn new(email: Arc<E>) -> Self {
        Self {
            email,
            address: DEFAULT_NOTIFICATION_ADDRESS.to_string(),
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }
}

#[async_trait]
impl<E: EmailService> MessageHandler for OrderConsumer<E> {
    type Message = OrderCommand;
    type Error = OrderConsumerError;

    async fn handle(&self, order: OrderCommand, ctx: HandlerContext) -> Result<(), OrderConsumerError> {
        debug!(?order, "Consume called");
        info!(
            order_id = %order.order_id,
            order_number = %order.order_number,
            attempt = ctx.attempt,
            "Consume order message"
        );

        let notification = Notification::order_confirmation(&order, self.address.clone());
        self.email
            .send(&notification)
            .await
            .map_err(|source| OrderConsumerError::Email {
                order_number: order.order_number.clone(),
                source,
            })?;

        info!(
            order_number = %order.order_number,
            notification_id = %notification.notification_id,
            "Consumed order message"
        );
        Ok(())
    }
}
