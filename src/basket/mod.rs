//! # Basket Cache Repository
//!
//! Stores each customer's basket as one JSON value under `basket:{buyer_id}` in a
//! [`KeyValueStore`]. Updates replace the whole basket and the last writer wins; there
//! is no versioning between concurrent updates.
//!
//! Two stores ship with the crate: [`InMemoryStore`] and [`RedisStore`]. The one in use
//! is chosen once at start by [`connect_store`].

mod checkout;
mod error;
mod redis_store;
mod store;

pub use checkout::CheckoutService;
pub use error::{BasketError, CheckoutError};
pub use redis_store::RedisStore;
pub use store::{InMemoryStore, KeyValueStore};

use crate::config::{AppConfig, BasketStoreKind};
use crate::model::CustomerBasket;
use std::sync::Arc;
use tracing::{debug, info, instrument};

const KEY_PREFIX: &str = "basket:";

fn key(buyer_id: &str) -> String {
    format!("{KEY_PREFIX}{buyer_id}")
}

#[derive(Clone)]
pub struct BasketRepository {
    store: Arc<dyn KeyValueStore>,
}

impl BasketRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// The stored basket, or `None` when the buyer has none.
    pub async fn find(&self, buyer_id: &str) -> Result<Option<CustomerBasket>, BasketError> {
        match self.store.get(&key(buyer_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// The stored basket, or an empty one when the buyer has none.
    #[instrument(skip(self))]
    pub async fn get(&self, buyer_id: &str) -> Result<CustomerBasket, BasketError> {
        let basket = self.find(buyer_id).await?;
        debug!(found = basket.is_some(), "Get basket");
        Ok(basket.unwrap_or_else(|| CustomerBasket::empty(buyer_id)))
    }

    /// Replaces the buyer's basket wholesale and returns what is now stored.
    #[instrument(skip(self, basket), fields(buyer_id = %basket.buyer_id))]
    pub async fn update(&self, basket: CustomerBasket) -> Result<CustomerBasket, BasketError> {
        basket.validate().map_err(BasketError::Invalid)?;
        let json = serde_json::to_string(&basket)?;
        self.store.set(&key(&basket.buyer_id), json).await?;
        info!(items = basket.items.len(), "Basket updated");
        Ok(basket)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, buyer_id: &str) -> Result<bool, BasketError> {
        let deleted = self.store.delete(&key(buyer_id)).await?;
        info!(deleted, "Basket deleted");
        Ok(deleted)
    }

    /// Buyers that currently have a stored basket, sorted.
    pub async fn buyer_ids(&self) -> Result<Vec<String>, BasketError> {
        let mut ids: Vec<String> = self
            .store
            .keys(KEY_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(KEY_PREFIX).map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Opens the store named by the configuration.
pub async fn connect_store(config: &AppConfig) -> Result<Arc<dyn KeyValueStore>, BasketError> {
    let store: Arc<dyn KeyValueStore> = match config.basket_store {
        BasketStoreKind::Memory => Arc::new(InMemoryStore::new()),
        BasketStoreKind::Redis => Arc::new(RedisStore::connect(&config.redis_url).await?),
    };
    info!(store = ?config.basket_store, "Basket store ready");
    Ok(store)
}
