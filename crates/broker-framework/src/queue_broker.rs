//! # Queue Broker Variant
//!
//! An AMQP-style broker engine and its transport.
//!
//! ## Semantics
//!
//! - One durable FIFO queue per queue name, declared on first use.
//! - Each subscription holds at most `prefetch_count` unacknowledged deliveries. A
//!   credit permit travels with every [`Delivery`] and is returned when it is settled.
//! - `nack(requeue = true)` puts the message back at the head of the queue.
//!   `nack(requeue = false)` moves it to the queue's dead-letter list.
//! - A message delivered `max_deliveries` times and nacked again is dead-lettered.
//! - Closing a subscription requeues every delivery it still holds.
//! - A queue holds at most `max_queue_depth` messages (ready plus unacked); publishing
//!   to a full queue is rejected, as with an overflow policy of `reject-publish`.

use crate::config::{BrokerEndpointConfig, EndpointScheme, TransportKind, IN_PROCESS_SCHEME};
use crate::error::BrokerError;
use crate::message::{Acknowledger, Delivery, RawMessage};
use crate::retry::connect_with_retry;
use crate::transport::{check_queue, BrokerTransport, Subscription};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, instrument, warn};

pub const DEFAULT_MAX_DELIVERIES: u32 = 10;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 10_000;

// ============================================================================
// Broker engine
// ============================================================================

/// In-process queue broker. Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct QueueBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: AtomicU64,
    next_consumer: AtomicU64,
    failing_connects: AtomicU32,
    max_deliveries: u32,
    max_queue_depth: usize,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    dead_letters: Vec<RawMessage>,
    notify: Arc<Notify>,
}

struct StoredMessage {
    message: RawMessage,
    deliveries: u32,
}

struct Unacked {
    stored: StoredMessage,
    consumer: u64,
}

impl Default for QueueBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueBroker {
    pub fn new() -> Self {
        Self::with_max_deliveries(DEFAULT_MAX_DELIVERIES)
    }

    pub fn with_max_deliveries(max_deliveries: u32) -> Self {
        Self::with_limits(max_deliveries, DEFAULT_MAX_QUEUE_DEPTH)
    }

    pub fn with_limits(max_deliveries: u32, max_queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: Mutex::new(HashMap::new()),
                next_tag: AtomicU64::new(1),
                next_consumer: AtomicU64::new(1),
                failing_connects: AtomicU32::new(0),
                max_deliveries: max_deliveries.max(1),
                max_queue_depth: max_queue_depth.max(1),
            }),
        }
    }

    /// Makes the next `count` connection attempts fail with a transient error.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.queues().get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.queues().get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<RawMessage> {
        self.queues()
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn dial(&self) -> Result<(), BrokerError> {
        let failing = &self.inner.failing_connects;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::ConnectFailed("broker unreachable".into()));
        }
        Ok(())
    }

    fn enqueue(&self, queue: &str, message: RawMessage) -> Result<(), BrokerError> {
        let max_depth = self.inner.max_queue_depth;
        let mut queues = self.queues();
        let state = queues.entry(queue.to_string()).or_default();
        if state.ready.len() + state.unacked.len() >= max_depth {
            warn!(queue, max_depth, "Queue full, publish rejected");
            return Err(BrokerError::Publish(format!(
                "queue '{queue}' is full ({max_depth} messages)"
            )));
        }
        state.ready.push_back(StoredMessage {
            message,
            deliveries: 0,
        });
        state.notify.notify_waiters();
        Ok(())
    }

    fn notifier(&self, queue: &str) -> Arc<Notify> {
        self.queues()
            .entry(queue.to_string())
            .or_default()
            .notify
            .clone()
    }

    /// Moves the head of `queue` to the unacked set of `consumer`.
    fn take(&self, queue: &str, consumer: u64) -> Option<(RawMessage, u32, u64)> {
        let mut queues = self.queues();
        let state = queues.get_mut(queue)?;
        let mut stored = state.ready.pop_front()?;
        stored.deliveries += 1;

        let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
        let message = stored.message.clone();
        let attempt = stored.deliveries;
        state.unacked.insert(tag, Unacked { stored, consumer });
        Some((message, attempt, tag))
    }

    fn settle(&self, queue: &str, tag: u64, outcome: Settle) {
        let mut queues = self.queues();
        let Some(state) = queues.get_mut(queue) else {
            return;
        };
        let Some(unacked) = state.unacked.remove(&tag) else {
            // Already requeued by a closed subscription.
            debug!(queue, tag, "Settle for unknown delivery tag ignored");
            return;
        };

        match outcome {
            Settle::Ack => {}
            Settle::Requeue if unacked.stored.deliveries < self.inner.max_deliveries => {
                state.ready.push_front(unacked.stored);
                state.notify.notify_waiters();
            }
            Settle::Requeue | Settle::Reject => {
                warn!(
                    queue,
                    message_id = %unacked.stored.message.message_id,
                    deliveries = unacked.stored.deliveries,
                    "Message dead-lettered"
                );
                state.dead_letters.push(unacked.stored.message);
            }
        }
    }

    /// Returns every delivery held by `consumer` to the head of the queue, in order.
    fn requeue_consumer(&self, queue: &str, consumer: u64) -> usize {
        let mut queues = self.queues();
        let Some(state) = queues.get_mut(queue) else {
            return 0;
        };

        let mut tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == consumer)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.iter().rev() {
            if let Some(unacked) = state.unacked.remove(tag) {
                state.ready.push_front(unacked.stored);
            }
        }
        if !tags.is_empty() {
            state.notify.notify_waiters();
        }
        tags.len()
    }
}

enum Settle {
    Ack,
    Requeue,
    Reject,
}

struct QueueAcker {
    broker: QueueBroker,
    queue: String,
}

#[async_trait]
impl Acknowledger for QueueAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.broker.settle(&self.queue, delivery_tag, Settle::Ack);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let outcome = if requeue { Settle::Requeue } else { Settle::Reject };
        self.broker.settle(&self.queue, delivery_tag, outcome);
        Ok(())
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct QueueBrokerTransport {
    broker: QueueBroker,
    prefetch_count: u16,
}

impl QueueBrokerTransport {
    /// Attaches to the in-process `broker`. Only `memory://` endpoints are accepted; a
    /// broker on the network goes through [`JetStreamTransport`](crate::jetstream::JetStreamTransport).
    #[instrument(skip(broker, config), fields(endpoint = %config.connection_string))]
    pub async fn connect(
        broker: QueueBroker,
        config: &BrokerEndpointConfig,
    ) -> Result<Self, BrokerError> {
        let endpoint = config.connection_string.as_str();
        if config.scheme()? != EndpointScheme::InProcess {
            return Err(BrokerError::InvalidConfig(format!(
                "in-process queue broker expects {IN_PROCESS_SCHEME}, got '{endpoint}'"
            )));
        }

        connect_with_retry(config.retry_policy(), endpoint, || broker.dial()).await?;

        Ok(Self {
            broker,
            prefetch_count: config.prefetch_count.max(1),
        })
    }

    pub fn broker(&self) -> &QueueBroker {
        &self.broker
    }
}

#[async_trait]
impl BrokerTransport for QueueBrokerTransport {
    async fn publish(&self, queue: &str, message: RawMessage) -> Result<(), BrokerError> {
        check_queue(queue)?;
        debug!(queue, message_id = %message.message_id, "Publishing message");
        self.broker.enqueue(queue, message)
    }

    async fn subscribe(
        &self,
        queue: &str,
        _concurrency_limit: usize,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        check_queue(queue)?;
        let consumer = self.broker.inner.next_consumer.fetch_add(1, Ordering::Relaxed);
        let notify = self.broker.notifier(queue);

        Ok(Box::new(QueueBrokerSubscription {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            consumer,
            credits: Arc::new(Semaphore::new(self.prefetch_count as usize)),
            acker: Arc::new(QueueAcker {
                broker: self.broker.clone(),
                queue: queue.to_string(),
            }),
            notify,
            closed: false,
        }))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::QueueBroker
    }
}

struct QueueBrokerSubscription {
    broker: QueueBroker,
    queue: String,
    consumer: u64,
    credits: Arc<Semaphore>,
    acker: Arc<QueueAcker>,
    notify: Arc<Notify>,
    closed: bool,
}

#[async_trait]
impl Subscription for QueueBrokerSubscription {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        if self.closed {
            return None;
        }
        let credit = self.credits.clone().acquire_owned().await.ok()?;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((message, attempt, tag)) = self.broker.take(&self.queue, self.consumer) {
                let acker: Arc<dyn Acknowledger> = self.acker.clone();
                return Some(Delivery::new(message, attempt, tag, acker).with_credit(credit));
            }
            notified.await;
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.credits.close();
        let requeued = self.broker.requeue_consumer(&self.queue, self.consumer);
        debug!(queue = %self.queue, requeued, "Subscription closed");
    }
}

impl Drop for QueueBrokerSubscription {
    fn drop(&mut self) {
        if !self.closed {
            self.broker.requeue_consumer(&self.queue, self.consumer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn raw(id: &str) -> RawMessage {
        RawMessage {
            message_id: id.to_string(),
            headers: Default::default(),
            body: b"{}".to_vec(),
        }
    }

    async fn transport(broker: &QueueBroker, prefetch: u16) -> QueueBrokerTransport {
        let config = BrokerEndpointConfig::new(TransportKind::QueueBroker, "memory://", "q")
            .with_prefetch_count(prefetch);
        QueueBrokerTransport::connect(broker.clone(), &config).await.unwrap()
    }

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let broker = QueueBroker::new();
        let transport = transport(&broker, 4).await;
        transport.publish("q", raw("a")).await.unwrap();
        transport.publish("q", raw("b")).await.unwrap();

        let mut sub = transport.subscribe("q", 1).await.unwrap();
        let first = sub.next_delivery().await.unwrap();
        let second = sub.next_delivery().await.unwrap();
        assert_eq!(first.message().message_id, "a");
        assert_eq!(second.message().message_id, "b");
        assert_eq!(broker.unacked_count("q"), 2);

        first.ack().await.unwrap();
        second.ack().await.unwrap();
        assert_eq!(broker.unacked_count("q"), 0);
        assert_eq!(broker.ready_count("q"), 0);
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let broker = QueueBroker::new();
        let transport = transport(&broker, 2).await;
        for id in ["a", "b", "c"] {
            transport.publish("q", raw(id)).await.unwrap();
        }

        let mut sub = transport.subscribe("q", 1).await.unwrap();
        let a = sub.next_delivery().await.unwrap();
        let _b = sub.next_delivery().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), sub.next_delivery()).await;
        assert!(blocked.is_err(), "third delivery must wait for a credit");
        assert_eq!(broker.unacked_count("q"), 2);

        a.ack().await.unwrap();
        let c = sub.next_delivery().await.unwrap();
        assert_eq!(c.message().message_id, "c");
    }

    #[tokio::test]
    async fn test_requeue_goes_to_head_and_counts_attempts() {
        let broker = QueueBroker::new();
        let transport = transport(&broker, 4).await;
        transport.publish("q", raw("a")).await.unwrap();
        transport.publish("q", raw("b")).await.unwrap();

        let mut sub = transport.subscribe("q", 1).await.unwrap();
        let a = sub.next_delivery().await.unwrap();
        assert_eq!(a.attempt(), 1);
        a.nack(true).await.unwrap();

        let again = sub.next_delivery().await.unwrap();
        assert_eq!(again.message().message_id, "a");
        assert_eq!(again.attempt(), 2);
        assert!(again.is_redelivery());
    }

    #[tokio::test]
    async fn test_reject_and_redelivery_limit_dead_letter() {
        let broker = QueueBroker::with_max_deliveries(2);
        let transport = transport(&broker, 4).await;
        transport.publish("q", raw("poison")).await.unwrap();
        transport.publish("q", raw("garbage")).await.unwrap();

        let mut sub = transport.subscribe("q", 1).await.unwrap();
        let poison = sub.next_delivery().await.unwrap();
        poison.nack(true).await.unwrap();
        let poison = sub.next_delivery().await.unwrap();
        assert_eq!(poison.attempt(), 2);
        poison.nack(true).await.unwrap();

        let garbage = sub.next_delivery().await.unwrap();
        assert_eq!(garbage.message().message_id, "garbage");
        garbage.nack(false).await.unwrap();

        let dead: Vec<_> = broker
            .dead_letters("q")
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(dead, vec!["poison".to_string(), "garbage".to_string()]);
        assert_eq!(broker.ready_count("q"), 0);
    }

    #[tokio::test]
    async fn test_close_requeues_unacked_and_late_ack_is_ignored() {
        let broker = QueueBroker::new();
        let transport = transport(&broker, 4).await;
        transport.publish("q", raw("a")).await.unwrap();

        let mut sub = transport.subscribe("q", 1).await.unwrap();
        let held = sub.next_delivery().await.unwrap();
        sub.close().await;
        assert!(sub.next_delivery().await.is_none());
        assert_eq!(broker.ready_count("q"), 1);

        held.ack().await.unwrap();
        assert_eq!(broker.ready_count("q"), 1);

        let mut next = transport.subscribe("q", 1).await.unwrap();
        let redelivered = next.next_delivery().await.unwrap();
        assert_eq!(redelivered.message().message_id, "a");
        assert_eq!(redelivered.attempt(), 2);
    }

    #[tokio::test]
    async fn test_waiting_subscriber_wakes_on_publish() {
        let broker = QueueBroker::new();
        let transport = Arc::new(transport(&broker, 4).await);
        let mut sub = transport.subscribe("q", 1).await.unwrap();

        let waiter = tokio::spawn(async move { sub.next_delivery().await.map(|d| d.message().clone()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.publish("q", raw("late")).await.unwrap();

        let message = waiter.await.unwrap().unwrap();
        assert_eq!(message.message_id, "late");
    }

    #[tokio::test]
    async fn test_full_queue_rejects_publish_until_drained() {
        let broker = QueueBroker::with_limits(DEFAULT_MAX_DELIVERIES, 2);
        let transport = transport(&broker, 4).await;
        transport.publish("q", raw("a")).await.unwrap();
        transport.publish("q", raw("b")).await.unwrap();

        let rejected = transport.publish("q", raw("c")).await;
        assert!(matches!(rejected, Err(BrokerError::Publish(_))));
        assert_eq!(broker.ready_count("q"), 2);

        // Unacked messages still count against the depth.
        let mut sub = transport.subscribe("q", 1).await.unwrap();
        let first = sub.next_delivery().await.unwrap();
        assert!(transport.publish("q", raw("c")).await.is_err());

        first.ack().await.unwrap();
        transport.publish("q", raw("c")).await.unwrap();
        assert_eq!(broker.ready_count("q") + broker.unacked_count("q"), 2);
    }

    #[tokio::test]
    async fn test_connect_validates_scheme() {
        let config = BrokerEndpointConfig::new(TransportKind::QueueBroker, "sqs://nope", "q");
        let result = QueueBrokerTransport::connect(QueueBroker::new(), &config).await;
        assert!(matches!(result, Err(BrokerError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_transient_failures() {
        let broker = QueueBroker::new();
        broker.fail_next_connects(2);
        let config = BrokerEndpointConfig::new(TransportKind::QueueBroker, "memory://", "q")
            .with_max_connect_retries(3);
        assert!(QueueBrokerTransport::connect(broker.clone(), &config).await.is_ok());

        broker.fail_next_connects(5);
        let result = QueueBrokerTransport::connect(broker, &config).await;
        assert!(matches!(result, Err(BrokerError::ConnectExhausted { attempts: 3, .. })));
    }
}
