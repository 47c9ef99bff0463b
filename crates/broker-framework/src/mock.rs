//! # Mock Transport & Testing Guide
//!
//! [`MockTransport`] implements [`BrokerTransport`] entirely in memory. It lets you set
//! publish expectations, inject failures, hand-deliver raw messages to a subscriber and
//! inspect how each delivery was settled.
//!
//! ## When to use the Mock vs a Real Engine
//!
//! | Feature | MockTransport | QueueBroker / CloudQueue |
//! |---------|---------------|--------------------------|
//! | **Determinism** | Publish outcomes scripted up front | Real queue semantics |
//! | **Error Injection** | `return_err(..)` per publish | Connect failures only |
//! | **Settlement** | Recorded as [`Settlement`]s | Observable through queue counts |
//! | **Use Case** | Producers and handlers in isolation | Delivery semantics, full system |
//!
//! ## Example: Publisher failure
//!
//! ```rust
//! use broker_framework::mock::MockTransport;
//! use broker_framework::{BrokerError, BrokerTransport, MessageEnvelope, TraceContext};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mock = MockTransport::new();
//!     mock.expect_publish("orders").return_ok();
//!     mock.expect_publish("orders").return_err(BrokerError::Publish("broker down".into()));
//!
//!     let raw = MessageEnvelope::new(1u32, "corr-1", &TraceContext::new_root()).encode().unwrap();
//!     assert!(mock.publish("orders", raw.clone()).await.is_ok());
//!     assert!(mock.publish("orders", raw).await.is_err());
//!
//!     assert_eq!(mock.published("orders").len(), 1);
//!     mock.verify();
//! }
//! ```
//!
//! ## Example: Driving a subscriber by hand
//!
//! ```rust
//! use broker_framework::mock::{MockTransport, Settlement};
//! use broker_framework::{BrokerTransport, MessageEnvelope, TraceContext};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mock = MockTransport::new();
//!     let mut sub = mock.subscribe("orders", 1).await.unwrap();
//!
//!     let raw = MessageEnvelope::new(1u32, "corr-1", &TraceContext::new_root()).encode().unwrap();
//!     let id = raw.message_id.clone();
//!     mock.deliver("orders", raw);
//!
//!     sub.next_delivery().await.unwrap().ack().await.unwrap();
//!     assert_eq!(mock.settlements(), vec![Settlement::Acked(id)]);
//! }
//! ```

use crate::config::TransportKind;
use crate::error::BrokerError;
use crate::message::{Acknowledger, Delivery, RawMessage};
use crate::transport::{BrokerTransport, Subscription};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

// =============================================================================
// EXPECTATION BUILDER API
// =============================================================================

struct PublishExpectation {
    queue: String,
    response: Result<(), BrokerError>,
}

/// How a delivery handed out by the mock was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked(String),
    Nacked { message_id: String, requeue: bool },
}

#[derive(Default)]
struct MockState {
    expectations: VecDeque<PublishExpectation>,
    published: Vec<(String, RawMessage)>,
    subscribers: HashMap<String, mpsc::UnboundedSender<RawMessage>>,
    in_flight: HashMap<u64, String>,
    settlements: Vec<Settlement>,
}

/// In-memory transport with scripted publish outcomes.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    next_tag: Arc<AtomicU64>,
    kind: TransportKind,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_kind(TransportKind::QueueBroker)
    }

    pub fn with_kind(kind: TransportKind) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            next_tag: Arc::new(AtomicU64::new(1)),
            kind,
        }
    }

    /// Expects the next `publish` to target `queue`.
    pub fn expect_publish(&self, queue: impl Into<String>) -> PublishExpectationBuilder {
        PublishExpectationBuilder {
            queue: queue.into(),
            state: self.state.clone(),
        }
    }

    /// Messages accepted on `queue`, in publish order.
    pub fn published(&self, queue: &str) -> Vec<RawMessage> {
        self.lock()
            .published
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Hands `message` to the current subscriber of `queue`, if any.
    pub fn deliver(&self, queue: &str, message: RawMessage) -> bool {
        match self.lock().subscribers.get(queue) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.clone()
    }

    /// Panics if any publish expectation is still pending.
    pub fn verify(&self) {
        let remaining = self.lock().expectations.len();
        if remaining != 0 {
            panic!("Not all expectations were met. {remaining} remaining");
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for `publish` expectations.
pub struct PublishExpectationBuilder {
    queue: String,
    state: Arc<Mutex<MockState>>,
}

impl PublishExpectationBuilder {
    /// The publish is accepted and recorded.
    pub fn return_ok(self) {
        self.push(Ok(()));
    }

    /// The publish fails with `error` and nothing is recorded.
    pub fn return_err(self, error: BrokerError) {
        self.push(Err(error));
    }

    fn push(self, response: Result<(), BrokerError>) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .expectations
            .push_back(PublishExpectation {
                queue: self.queue,
                response,
            });
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn publish(&self, queue: &str, message: RawMessage) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let Some(expectation) = state.expectations.pop_front() else {
            panic!("Unexpected publish to '{queue}'");
        };
        if expectation.queue != queue {
            panic!(
                "Expected publish to '{}', got '{queue}'",
                expectation.queue
            );
        }
        expectation.response?;
        state.published.push((queue.to_string(), message));
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _concurrency_limit: usize,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().subscribers.insert(queue.to_string(), sender);
        Ok(Box::new(MockSubscription {
            transport: self.clone(),
            receiver,
        }))
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

struct MockSubscription {
    transport: MockTransport,
    receiver: mpsc::UnboundedReceiver<RawMessage>,
}

#[async_trait]
impl Subscription for MockSubscription {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        let message = self.receiver.recv().await?;
        let tag = self.transport.next_tag.fetch_add(1, Ordering::Relaxed);
        self.transport
            .lock()
            .in_flight
            .insert(tag, message.message_id.clone());
        let acker: Arc<dyn Acknowledger> = Arc::new(self.transport.clone());
        Some(Delivery::new(message, 1, tag, acker))
    }

    async fn close(&mut self) {
        self.receiver.close();
    }
}

#[async_trait]
impl Acknowledger for MockTransport {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if let Some(message_id) = state.in_flight.remove(&delivery_tag) {
            state.settlements.push(Settlement::Acked(message_id));
        }
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if let Some(message_id) = state.in_flight.remove(&delivery_tag) {
            state.settlements.push(Settlement::Nacked {
                message_id,
                requeue,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str) -> RawMessage {
        RawMessage {
            message_id: id.to_string(),
            headers: Default::default(),
            body: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_expectations_are_consumed_in_order() {
        let mock = MockTransport::new();
        mock.expect_publish("a").return_ok();
        mock.expect_publish("b").return_err(BrokerError::Closed);

        assert!(mock.publish("a", raw("1")).await.is_ok());
        assert!(matches!(
            mock.publish("b", raw("2")).await,
            Err(BrokerError::Closed)
        ));
        assert_eq!(mock.published("a").len(), 1);
        assert!(mock.published("b").is_empty());
        mock.verify();
    }

    #[tokio::test]
    #[should_panic(expected = "Unexpected publish")]
    async fn test_unexpected_publish_panics() {
        let mock = MockTransport::new();
        let _ = mock.publish("a", raw("1")).await;
    }

    #[tokio::test]
    #[should_panic(expected = "Not all expectations were met")]
    async fn test_verify_reports_pending_expectations() {
        let mock = MockTransport::new();
        mock.expect_publish("a").return_ok();
        mock.verify();
    }

    #[tokio::test]
    async fn test_settlements_are_recorded() {
        let mock = MockTransport::new();
        let mut sub = mock.subscribe("q", 1).await.unwrap();
        assert!(mock.deliver("q", raw("x")));
        assert!(mock.deliver("q", raw("y")));
        assert!(!mock.deliver("other", raw("z")));

        sub.next_delivery().await.unwrap().ack().await.unwrap();
        sub.next_delivery().await.unwrap().nack(true).await.unwrap();

        assert_eq!(
            mock.settlements(),
            vec![
                Settlement::Acked("x".into()),
                Settlement::Nacked {
                    message_id: "y".into(),
                    requeue: true
                }
            ]
        );
    }
}
