//! Application configuration, read once from the environment at start.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `BROKER_TRANSPORT` | `queue-broker` | `queue-broker` or `cloud-queue` |
//! | `BROKER_CONNECTION_STRING` | `nats://localhost:4222` | NATS JetStream server, or `memory://` for in-process queues |
//! | `ORDER_QUEUE` | `order-queue` | Queue carrying order commands |
//! | `CHECKOUT_QUEUE` | `basket-checkout-queue` | Queue carrying accepted checkouts |
//! | `BROKER_PREFETCH_COUNT` | `4` | Unacked deliveries per subscription |
//! | `CONSUMER_CONCURRENCY_LIMIT` | `2` | Handlers running at once |
//! | `BROKER_MAX_CONNECT_RETRIES` | `5` | Connection attempts before giving up |
//! | `BROKER_MAX_CONNECT_BACKOFF_MS` | `10000` | Cap on the delay between attempts |
//! | `CONSUMER_STOP_TIMEOUT_MS` | `5000` | Drain window on shutdown |
//! | `HTTP_PORT` | `8080` | HTTP listen port |
//! | `BASKET_STORE` | `memory` | `memory` or `redis` |
//! | `REDIS_URL` | `redis://127.0.0.1:6379` | Used when `BASKET_STORE=redis` |

use broker_framework::{BrokerEndpointConfig, BrokerError, TransportKind};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONNECTION_STRING: &str = "nats://localhost:4222";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value '{value}': {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasketStoreKind {
    Memory,
    Redis,
}

impl FromStr for BasketStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(BasketStoreKind::Memory),
            "redis" => Ok(BasketStoreKind::Redis),
            other => Err(format!("expected 'memory' or 'redis', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Endpoint for the order queue; other queues reuse it with `for_queue`.
    pub broker: BrokerEndpointConfig,
    pub checkout_queue: String,
    pub http_port: u16,
    pub basket_store: BasketStoreKind,
    pub redis_url: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let transport_kind: TransportKind = parse(&lookup, "BROKER_TRANSPORT", TransportKind::QueueBroker)?;
        let connection_string = lookup("BROKER_CONNECTION_STRING")
            .unwrap_or_else(|| DEFAULT_CONNECTION_STRING.to_string());
        let order_queue = lookup("ORDER_QUEUE").unwrap_or_else(|| "order-queue".to_string());

        let broker = BrokerEndpointConfig::new(transport_kind, connection_string, order_queue)
            .with_prefetch_count(parse(&lookup, "BROKER_PREFETCH_COUNT", 4)?)
            .with_concurrency_limit(parse(&lookup, "CONSUMER_CONCURRENCY_LIMIT", 2)?)
            .with_max_connect_retries(parse(&lookup, "BROKER_MAX_CONNECT_RETRIES", 5)?)
            .with_max_connect_backoff(Duration::from_millis(parse(
                &lookup,
                "BROKER_MAX_CONNECT_BACKOFF_MS",
                10_000,
            )?))
            .with_stop_timeout(Duration::from_millis(parse(
                &lookup,
                "CONSUMER_STOP_TIMEOUT_MS",
                5_000,
            )?));
        broker.validate()?;

        let config = Self {
            broker,
            checkout_queue: lookup("CHECKOUT_QUEUE")
                .unwrap_or_else(|| "basket-checkout-queue".to_string()),
            http_port: parse(&lookup, "HTTP_PORT", 8080)?,
            basket_store: parse(&lookup, "BASKET_STORE", BasketStoreKind::Memory)?,
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
        };
        if config.checkout_queue.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "CHECKOUT_QUEUE",
                value: config.checkout_queue,
                reason: "must not be empty".into(),
            });
        }
        Ok(config)
    }

    pub fn order_queue(&self) -> &str {
        &self.broker.queue_name
    }
}

fn parse<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::InvalidValue {
                name,
                reason: e.to_string(),
                value,
            })
        }
    }
}
