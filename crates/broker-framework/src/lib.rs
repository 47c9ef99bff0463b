//! # Broker Framework
//!
//! This crate provides the building blocks for moving typed commands across a message
//! broker while keeping a distributed trace intact. It is the asynchronous half of the
//! order pipeline: producers publish [`MessageEnvelope`]s through a [`BrokerTransport`],
//! and a [`ConsumerDispatcher`] feeds deliveries to a [`MessageHandler`] under a bounded
//! concurrency window.
//!
//! ## 🧭 Design
//!
//! ### Transport as a seam
//!
//! Producer and consumer code never branch on the broker kind. They hold an
//! `Arc<dyn BrokerTransport>` that was selected once from configuration by
//! [`transport::connect`]. Two variants ship with the crate:
//!
//! - queue broker: durable FIFO queues, `prefetch_count` bounds the unacknowledged
//!   deliveries a subscription may hold.
//! - cloud queue: visibility timeouts and a receive-count redrive; the number of
//!   parallel receive cycles is bounded by the concurrency limit.
//!
//! The connection string picks the backend. `nats://` and `tls://` dial a NATS server
//! and run either variant on JetStream ([`JetStreamTransport`]). `memory://` attaches to
//! the in-process engines of a [`BrokerHub`] ([`QueueBrokerTransport`],
//! [`CloudQueueTransport`]), which tests use to observe queues directly.
//!
//! Every backend connects through [`retry::connect_with_retry`], which backs off
//! exponentially up to a cap and gives up after a configured number of attempts.
//!
//! ### Trace context as a value
//!
//! There is no global tracer. A [`TraceContext`] is created (or continued) by the
//! producer, written into the envelope headers by [`trace::inject`], and read back by
//! the dispatcher with [`trace::extract`]. Extraction is permissive: a missing or
//! corrupt `traceparent` produces a fresh root context instead of an error.
//!
//! ### Delivery semantics
//!
//! Delivery is **at-least-once**. A handler returning `Ok` acks the message; an error
//! or a panic nacks it for redelivery, subject to the broker's own redelivery limit.
//! Handlers must tolerate duplicates.
//!
//! ## 🗺️ Module Tour
//!
//! - [`trace`] - W3C-style `traceparent` codec and [`TraceContext`]
//! - [`message`] - [`MessageEnvelope`], [`RawMessage`] and [`Delivery`]
//! - [`transport`] - the [`BrokerTransport`] trait and variant selection
//! - [`jetstream`] - both variants on a NATS JetStream server
//! - [`queue_broker`] / [`cloud_queue`] - in-process engines for the two variants
//! - [`dispatcher`] - the [`ConsumerDispatcher`] state machine
//! - [`handler`] - the [`MessageHandler`] trait implemented by consumers
//! - [`mock`] - in-memory [`mock::MockTransport`] for tests
//!
//! ## 🚀 Quick Start
//!
//! ```rust
//! use broker_framework::{
//!     BrokerEndpointConfig, BrokerHub, BrokerTransport, ConsumerDispatcher, HandlerContext, MessageEnvelope,
//!     MessageHandler, TraceContext, TransportKind,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! #[derive(Debug, serde::Serialize, serde::Deserialize)]
//! struct Ping { n: u32 }
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("ping failed")]
//! struct PingError;
//!
//! struct PingHandler;
//!
//! #[async_trait]
//! impl MessageHandler for PingHandler {
//!     type Message = Ping;
//!     type Error = PingError;
//!
//!     async fn handle(&self, message: Ping, _ctx: HandlerContext) -> Result<(), PingError> {
//!         assert_eq!(message.n, 1);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), broker_framework::BrokerError> {
//!     let hub = BrokerHub::default();
//!     let config = BrokerEndpointConfig::new(TransportKind::QueueBroker, "memory://", "pings");
//!     let transport = broker_framework::transport::connect(&config, &hub).await?;
//!
//!     let mut dispatcher = ConsumerDispatcher::new(transport.clone(), Arc::new(PingHandler), &config);
//!     dispatcher.start().await?;
//!
//!     let envelope = MessageEnvelope::new(Ping { n: 1 }, "corr-1", &TraceContext::new_root());
//!     transport.publish("pings", envelope.encode()?).await?;
//!
//!     dispatcher.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod cloud_queue;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod jetstream;
pub mod message;
pub mod mock;
pub mod queue_broker;
pub mod retry;
pub mod trace;
pub mod transport;

// Re-export core types for convenience
pub use cloud_queue::{CloudQueue, CloudQueueTransport};
pub use config::{BrokerEndpointConfig, TransportKind};
pub use dispatcher::{ConsumerDispatcher, DispatcherState, DispatcherStats};
pub use error::BrokerError;
pub use handler::{HandlerContext, MessageHandler};
pub use jetstream::JetStreamTransport;
pub use message::{Acknowledger, Delivery, MessageEnvelope, RawMessage};
pub use queue_broker::{QueueBroker, QueueBrokerTransport};
pub use retry::RetryPolicy;
pub use trace::{Headers, SpanId, TraceContext, TraceId};
pub use transport::{BrokerHub, BrokerTransport, Subscription};
