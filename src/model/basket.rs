//! Shopping basket cache entries and the checkout messages derived from them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasketItem {
    #[serde(default)]
    pub id: String,
    pub product_id: String,
    #[serde(default)]
    pub product_name: String,
    pub unit_price: f64,
    pub quantity: u32,
}

/// A customer's basket, keyed by buyer id. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerBasket {
    pub buyer_id: String,
    #[serde(default)]
    pub items: Vec<BasketItem>,
}

impl CustomerBasket {
    pub fn empty(buyer_id: impl Into<String>) -> Self {
        Self {
            buyer_id: buyer_id.into(),
            items: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.items
            .iter()
            .map(|item| item.unit_price * f64::from(item.quantity))
            .sum()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.buyer_id.trim().is_empty() {
            return Err("buyerId must not be empty".to_string());
        }
        if let Some(item) = self
            .items
            .iter()
            .find(|item| !item.unit_price.is_finite() || item.unit_price < 0.0)
        {
            return Err(format!(
                "unitPrice of product {} must not be negative",
                item.product_id
            ));
        }
        Ok(())
    }
}

/// HTTP input for `POST /basket/checkout`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BasketCheckout {
    pub buyer: String,
    pub card_holder_name: String,
    pub city: String,
    pub street: String,
    pub country: String,
    pub zip_code: String,
    pub request_id: Option<Uuid>,
}

/// Published on the checkout queue once a basket is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutAccepted {
    pub buyer_id: String,
    pub buyer: String,
    pub card_holder_name: String,
    pub city: String,
    pub street: String,
    pub country: String,
    pub zip_code: String,
    pub request_id: Uuid,
    pub basket: CustomerBasket,
    pub correlation_id: String,
}

impl CheckoutAccepted {
    pub const MESSAGE_TYPE: &'static str = "basket.checkout-accepted";
}
