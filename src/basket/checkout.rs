//! Basket checkout: turns a stored basket into a `CheckoutAccepted` message.

use super::error::CheckoutError;
use super::BasketRepository;
use crate::correlation::parse_request_id;
use crate::model::{BasketCheckout, CheckoutAccepted};
use broker_framework::message::MESSAGE_TYPE_HEADER;
use broker_framework::{BrokerTransport, MessageEnvelope, TraceContext};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct CheckoutService {
    repository: BasketRepository,
    transport: Arc<dyn BrokerTransport>,
    queue: String,
}

impl CheckoutService {
    pub fn new(
        repository: BasketRepository,
        transport: Arc<dyn BrokerTransport>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            transport,
            queue: queue.into(),
        }
    }

    /// Checks out `buyer_id`'s basket.
    ///
    /// The request id is taken from `header_request_id` when it is a non-nil UUID,
    /// then from the body, and minted otherwise. It doubles as the correlation id.
    /// On success the basket is published on the checkout queue and then deleted.
    #[instrument(skip(self, checkout, inbound), fields(queue = %self.queue))]
    pub async fn checkout(
        &self,
        checkout: BasketCheckout,
        buyer_id: &str,
        header_request_id: Option<&str>,
        inbound: Option<&TraceContext>,
    ) -> Result<CheckoutAccepted, CheckoutError> {
        if buyer_id.trim().is_empty() {
            return Err(CheckoutError::Invalid("buyer must not be empty".into()));
        }

        // 1. Resolve the request id
        let request_id = parse_request_id(header_request_id)
            .or(checkout.request_id.filter(|id| !id.is_nil()))
            .unwrap_or_else(Uuid::new_v4);

        info!(
            buyer = %checkout.buyer,
            %request_id,
            card_holder_name = %checkout.card_holder_name,
            "Checkout basket"
        );

        // 2. Load the basket
        let basket = match self.repository.find(buyer_id).await? {
            Some(basket) if !basket.is_empty() => basket,
            _ => {
                warn!(%request_id, "Checkout without a basket");
                return Err(CheckoutError::BasketNotFound(buyer_id.to_string()));
            }
        };

        // 3. Publish, then clear
        let correlation_id = request_id.to_string();
        let accepted = CheckoutAccepted {
            buyer_id: buyer_id.to_string(),
            buyer: checkout.buyer,
            card_holder_name: checkout.card_holder_name,
            city: checkout.city,
            street: checkout.street,
            country: checkout.country,
            zip_code: checkout.zip_code,
            request_id,
            basket,
            correlation_id: correlation_id.clone(),
        };
        let trace = inbound.map_or_else(TraceContext::new_root, TraceContext::child);
        let raw = MessageEnvelope::new(accepted.clone(), correlation_id, &trace)
            .with_header(MESSAGE_TYPE_HEADER, CheckoutAccepted::MESSAGE_TYPE)
            .encode()?;
        self.transport.publish(&self.queue, raw).await?;

        self.repository.delete(buyer_id).await?;
        info!(%request_id, total = accepted.basket.total(), "Checkout accepted");
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basket::{BasketError, InMemoryStore};
    use crate::model::{BasketItem, CustomerBasket};
    use broker_framework::mock::MockTransport;
    use broker_framework::BrokerError;

    const QUEUE: &str = "basket-checkout-queue";

    async fn setup(with_basket: bool) -> (CheckoutService, BasketRepository, MockTransport) {
        let repository = BasketRepository::new(Arc::new(InMemoryStore::new()));
        if with_basket {
            repository
                .update(CustomerBasket {
                    buyer_id: "buyer-1".into(),
                    items: vec![BasketItem {
                        id: "1".into(),
                        product_id: "p-1".into(),
                        product_name: "Lamp".into(),
                        unit_price: 20.0,
                        quantity: 2,
                    }],
                })
                .await
                .unwrap();
        }
        let mock = MockTransport::new();
        let service = CheckoutService::new(repository.clone(), Arc::new(mock.clone()), QUEUE);
        (service, repository, mock)
    }

    fn checkout() -> BasketCheckout {
        BasketCheckout {
            buyer: "Ada".into(),
            card_holder_name: "Ada L".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_checkout_publishes_and_clears_basket() {
        let (service, repository, mock) = setup(true).await;
        mock.expect_publish(QUEUE).return_ok();
        let request_id = "0b9d7c5e-3f1a-4b2c-9d8e-7f6a5b4c3d2e";

        let accepted = service
            .checkout(checkout(), "buyer-1", Some(request_id), None)
            .await
            .unwrap();

        assert_eq!(accepted.request_id.to_string(), request_id);
        assert_eq!(accepted.basket.total(), 40.0);
        let published = mock.published(QUEUE);
        assert_eq!(published[0].correlation_id(), Some(request_id));
        let envelope = MessageEnvelope::<CheckoutAccepted>::decode(&published[0]).unwrap();
        assert_eq!(envelope.payload, accepted);
        assert!(repository.find("buyer-1").await.unwrap().is_none());
        mock.verify();
    }

    #[tokio::test]
    async fn test_missing_basket_is_rejected_without_publishing() {
        let (service, _repository, mock) = setup(false).await;
        let result = service.checkout(checkout(), "buyer-1", None, None).await;
        assert!(matches!(result, Err(CheckoutError::BasketNotFound(b)) if b == "buyer-1"));
        mock.verify();
    }

    #[tokio::test]
    async fn test_body_request_id_used_when_header_is_nil() {
        let (service, _repository, mock) = setup(true).await;
        mock.expect_publish(QUEUE).return_ok();
        let body_id = Uuid::new_v4();
        let request = BasketCheckout {
            request_id: Some(body_id),
            ..checkout()
        };

        let accepted = service
            .checkout(
                request,
                "buyer-1",
                Some("00000000-0000-0000-0000-000000000000"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(accepted.request_id, body_id);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_basket() {
        let (service, repository, mock) = setup(true).await;
        mock.expect_publish(QUEUE).return_err(BrokerError::Closed);

        let result = service.checkout(checkout(), "buyer-1", None, None).await;
        assert!(matches!(result, Err(CheckoutError::Publish(_))));
        assert!(repository.find("buyer-1").await.unwrap().is_some());
    }

    #[test]
    fn test_store_errors_convert() {
        let err: CheckoutError = BasketError::Store("down".into()).into();
        assert!(matches!(err, CheckoutError::Store(_)));
    }
}
