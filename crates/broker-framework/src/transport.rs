//! # Broker Transport
//!
//! The seam between pipeline code and the broker. Everything above this module holds an
//! `Arc<dyn BrokerTransport>` and never learns which variant it is talking to.
//!
//! [`connect`] reads the connection string: a NATS endpoint is dialed over the network
//! with bounded retries, a `memory://` endpoint attaches to the engines owned by a
//! [`BrokerHub`]. Either way the caller gets the trait object back.

use crate::cloud_queue::{CloudQueue, CloudQueueTransport};
use crate::config::{BrokerEndpointConfig, EndpointScheme, TransportKind};
use crate::error::BrokerError;
use crate::message::{Delivery, RawMessage};
use crate::jetstream::JetStreamTransport;
use crate::queue_broker::{QueueBroker, QueueBrokerTransport};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Publish/subscribe operations shared by every broker variant.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Hands `message` to the broker. Returns once the broker has accepted it.
    async fn publish(&self, queue: &str, message: RawMessage) -> Result<(), BrokerError>;

    /// Starts consuming `queue`. `concurrency_limit` sizes the variant's own flow control:
    /// the prefetch window is fixed by the endpoint, the cloud poller runs this many
    /// receive cycles in parallel.
    async fn subscribe(
        &self,
        queue: &str,
        concurrency_limit: usize,
    ) -> Result<Box<dyn Subscription>, BrokerError>;

    fn kind(&self) -> TransportKind;
}

/// A live consumer on one queue.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. `None` once the subscription is closed.
    async fn next_delivery(&mut self) -> Option<Delivery>;

    /// Stops receiving. Unsettled deliveries become eligible for redelivery.
    async fn close(&mut self);
}

/// The in-process broker engines behind `memory://` endpoints.
#[derive(Clone, Default)]
pub struct BrokerHub {
    pub queue_broker: QueueBroker,
    pub cloud_queue: CloudQueue,
}

impl BrokerHub {
    pub fn new(queue_broker: QueueBroker, cloud_queue: CloudQueue) -> Self {
        Self {
            queue_broker,
            cloud_queue,
        }
    }
}

/// Selects and connects the transport variant named by `config`.
pub async fn connect(
    config: &BrokerEndpointConfig,
    hub: &BrokerHub,
) -> Result<Arc<dyn BrokerTransport>, BrokerError> {
    config.validate()?;

    let scheme = config.scheme()?;
    let transport: Arc<dyn BrokerTransport> = match (scheme, config.transport_kind) {
        (EndpointScheme::Nats, _) => Arc::new(JetStreamTransport::connect(config).await?),
        (EndpointScheme::InProcess, TransportKind::QueueBroker) => {
            Arc::new(QueueBrokerTransport::connect(hub.queue_broker.clone(), config).await?)
        }
        (EndpointScheme::InProcess, TransportKind::CloudQueue) => {
            Arc::new(CloudQueueTransport::connect(hub.cloud_queue.clone(), config).await?)
        }
    };

    info!(
        transport = %config.transport_kind,
        backend = ?scheme,
        queue = %config.queue_name,
        "Broker transport connected"
    );
    Ok(transport)
}

/// Rejects empty queue names before they reach an engine.
pub(crate) fn check_queue(queue: &str) -> Result<(), BrokerError> {
    if queue.trim().is_empty() {
        return Err(BrokerError::UnknownQueue(queue.to_string()));
    }
    Ok(())
}
