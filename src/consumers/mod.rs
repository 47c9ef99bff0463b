//! Message handlers run by the consumer dispatcher.

pub mod email;
pub mod order_consumer;

pub use email::{EmailError, EmailService, LogEmailService};
pub use order_consumer::{OrderConsumer, OrderConsumerError};
