use crate::api::{self, AppState};
use crate::basket::{BasketError, BasketRepository, CheckoutService, KeyValueStore};
use crate::config::AppConfig;
use crate::consumers::{EmailService, OrderConsumer};
use crate::publisher::OrderPublisher;
use axum::Router;
use broker_framework::transport::connect;
use broker_framework::{BrokerError, BrokerHub, BrokerTransport, ConsumerDispatcher, DispatcherStats};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("Broker unavailable: {0}")]
    Broker(#[from] BrokerError),
    #[error("Basket store unavailable: {0}")]
    Store(#[from] BasketError),
}

/// The running pipeline: one broker connection shared by the producers and the order consumer.
///
/// # Example
///
/// ```ignore
/// let system = OrderSystem::start(&config, &BrokerHub::default(), store, Arc::new(LogEmailService)).await?;
/// let app = system.router();
/// // ... serve `app` ...
/// system.shutdown().await?;
/// ```
pub struct OrderSystem<E: EmailService> {
    pub transport: Arc<dyn BrokerTransport>,
    pub publisher: OrderPublisher,
    pub baskets: BasketRepository,
    pub checkout: CheckoutService,
    dispatcher: ConsumerDispatcher<OrderConsumer<E>>,
}

impl<E: EmailService> OrderSystem<E> {
    /// Connects to the broker (with retries) and starts consuming the order queue.
    ///
    /// Fails if the broker cannot be reached within the configured retry budget.
    pub async fn start(
        config: &AppConfig,
        hub: &BrokerHub,
        store: Arc<dyn KeyValueStore>,
        email: Arc<E>,
    ) -> Result<Self, SystemError> {
        // 1. Connect the transport
        let transport = connect(&config.broker, hub).await?;

        // 2. Producers share the connection
        let publisher = OrderPublisher::new(transport.clone(), config.order_queue());
        let baskets = BasketRepository::new(store);
        let checkout = CheckoutService::new(
            baskets.clone(),
            transport.clone(),
            config.checkout_queue.clone(),
        );

        // 3. Start the order consumer
        let consumer = Arc::new(OrderConsumer::new(email));
        let mut dispatcher = ConsumerDispatcher::new(transport.clone(), consumer, &config.broker);
        dispatcher.start().await?;

        info!(
            transport = %transport.kind(),
            order_queue = %config.order_queue(),
            checkout_queue = %config.checkout_queue,
            "Order system started"
        );

        Ok(Self {
            transport,
            publisher,
            baskets,
            checkout,
            dispatcher,
        })
    }

    pub fn router(&self) -> Router {
        api::router(AppState {
            publisher: self.publisher.clone(),
            baskets: self.baskets.clone(),
            checkout: self.checkout.clone(),
        })
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// Stops the order consumer, waiting up to the configured stop timeout for
    /// in-flight handlers.
    pub async fn shutdown(mut self) -> Result<(), BrokerError> {
        info!("Shutting down system...");

        // =====================================================================
        // Step 1: Stop consuming and drain in-flight handlers
        // =====================================================================

        if let Err(e) = self.dispatcher.stop().await {
            error!(error = %e, "Order consumer failed to stop");
            return Err(e);
        }

        // =====================================================================
        // Step 2: Release the producers' handle on the transport
        // =====================================================================

        let stats = self.dispatcher.stats();
        drop(self.publisher);
        drop(self.checkout);

        info!(
            processed = stats.processed,
            failed = stats.failed,
            rejected = stats.rejected,
            "System shutdown complete."
        );
        Ok(())
    }
}
