//! # Broker Endpoint Configuration
//!
//! One immutable [`BrokerEndpointConfig`] describes how to reach a broker and how a
//! consumer on it behaves. It is loaded once at start, validated, and then shared by
//! clone between the transport, the publisher and the dispatcher.

use crate::error::BrokerError;
use crate::retry::RetryPolicy;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PREFETCH_COUNT: u16 = 4;
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 2;
pub const DEFAULT_MAX_CONNECT_RETRIES: u32 = 5;
pub const DEFAULT_MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(10);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection strings with this prefix select the in-process engines of a
/// [`BrokerHub`](crate::transport::BrokerHub) instead of a broker on the network.
pub const IN_PROCESS_SCHEME: &str = "memory://";

/// What a connection string points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointScheme {
    /// A NATS server with JetStream enabled (`nats://` or `tls://`).
    Nats,
    /// The in-process engines of a `BrokerHub` (`memory://`).
    InProcess,
}

/// Which broker variant to talk to. Selected once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// AMQP-style broker with durable queues and prefetch credits.
    QueueBroker,
    /// Managed polled queue with visibility timeouts.
    CloudQueue,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::QueueBroker => "queue-broker",
            TransportKind::CloudQueue => "cloud-queue",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue-broker" | "rabbitmq" | "amqp" => Ok(TransportKind::QueueBroker),
            "cloud-queue" | "sqs" => Ok(TransportKind::CloudQueue),
            other => Err(BrokerError::InvalidConfig(format!(
                "unknown transport kind '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEndpointConfig {
    pub transport_kind: TransportKind,
    pub connection_string: String,
    pub queue_name: String,
    /// Max unacknowledged deliveries per subscription (queue-broker only).
    pub prefetch_count: u16,
    /// Max handlers executing at once per dispatcher.
    pub concurrency_limit: usize,
    pub max_connect_retries: u32,
    pub max_connect_backoff: Duration,
    /// How long `stop()` waits for in-flight handlers.
    pub stop_timeout: Duration,
}

impl BrokerEndpointConfig {
    pub fn new(
        transport_kind: TransportKind,
        connection_string: impl Into<String>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            transport_kind,
            connection_string: connection_string.into(),
            queue_name: queue_name.into(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            max_connect_retries: DEFAULT_MAX_CONNECT_RETRIES,
            max_connect_backoff: DEFAULT_MAX_CONNECT_BACKOFF,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_concurrency_limit(mut self, concurrency_limit: usize) -> Self {
        self.concurrency_limit = concurrency_limit;
        self
    }

    pub fn with_max_connect_retries(mut self, retries: u32) -> Self {
        self.max_connect_retries = retries;
        self
    }

    pub fn with_max_connect_backoff(mut self, backoff: Duration) -> Self {
        self.max_connect_backoff = backoff;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Same endpoint, different queue.
    pub fn for_queue(&self, queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..self.clone()
        }
    }

    pub fn scheme(&self) -> Result<EndpointScheme, BrokerError> {
        let endpoint = self.connection_string.trim();
        if endpoint.starts_with("nats://") || endpoint.starts_with("tls://") {
            Ok(EndpointScheme::Nats)
        } else if endpoint.starts_with(IN_PROCESS_SCHEME) {
            Ok(EndpointScheme::InProcess)
        } else {
            Err(BrokerError::InvalidConfig(format!(
                "unsupported broker endpoint '{endpoint}', expected nats://, tls:// or {IN_PROCESS_SCHEME}"
            )))
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        self.scheme()?;
        if self.queue_name.trim().is_empty() {
            return Err(BrokerError::InvalidConfig("queue name must not be empty".into()));
        }
        if self.prefetch_count == 0 {
            return Err(BrokerError::InvalidConfig("prefetch count must be >= 1".into()));
        }
        if self.concurrency_limit == 0 {
            return Err(BrokerError::InvalidConfig(
                "concurrency limit must be >= 1".into(),
            ));
        }
        if self.max_connect_retries == 0 {
            return Err(BrokerError::InvalidConfig(
                "max connect retries must be >= 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_connect_retries, self.max_connect_backoff)
    }
}
