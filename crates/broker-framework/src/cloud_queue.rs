//! # Cloud Queue Variant
//!
//! An SQS-style managed queue engine and its transport.
//!
//! - Receiving a message hides it for the visibility timeout instead of removing it.
//! - Ack deletes it. Nack makes it visible again immediately, or dead-letters it when
//!   `requeue` is false.
//! - A hidden message whose visibility timeout expires becomes visible again, so a
//!   consumer that disappears without settling loses nothing.
//! - The redrive policy dead-letters a message once it has been received
//!   `max_receive_count` times and comes back again.
//! - A queue holds at most `max_queue_depth` messages, visible or in flight; sending
//!   to a full queue is rejected.
//! - There is no prefetch. A subscription runs at most `concurrency_limit` receive
//!   cycles in parallel, and ordering is not guaranteed.

use crate::config::{BrokerEndpointConfig, EndpointScheme, TransportKind, IN_PROCESS_SCHEME};
use crate::error::BrokerError;
use crate::message::{Acknowledger, Delivery, RawMessage};
use crate::retry::connect_with_retry;
use crate::transport::{check_queue, BrokerTransport, Subscription};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy)]
pub struct CloudQueueSettings {
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub poll_interval: Duration,
    pub max_queue_depth: usize,
}

impl Default for CloudQueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 5,
            poll_interval: Duration::from_millis(20),
            max_queue_depth: 10_000,
        }
    }
}

/// In-process managed queue service. Clones share the same queues.
#[derive(Clone)]
pub struct CloudQueue {
    inner: Arc<CloudInner>,
}

struct CloudInner {
    settings: CloudQueueSettings,
    queues: Mutex<HashMap<String, CloudQueueState>>,
    next_receipt: AtomicU64,
    failing_connects: AtomicU32,
}

#[derive(Default)]
struct CloudQueueState {
    visible: VecDeque<CloudMessage>,
    in_flight: HashMap<u64, InFlight>,
    dead_letters: Vec<RawMessage>,
}

struct CloudMessage {
    message: RawMessage,
    receive_count: u32,
}

struct InFlight {
    entry: CloudMessage,
    visible_at: Instant,
}

impl Default for CloudQueue {
    fn default() -> Self {
        Self::new(CloudQueueSettings::default())
    }
}

impl CloudQueue {
    pub fn new(settings: CloudQueueSettings) -> Self {
        Self {
            inner: Arc::new(CloudInner {
                settings: CloudQueueSettings {
                    max_receive_count: settings.max_receive_count.max(1),
                    max_queue_depth: settings.max_queue_depth.max(1),
                    ..settings
                },
                queues: Mutex::new(HashMap::new()),
                next_receipt: AtomicU64::new(1),
                failing_connects: AtomicU32::new(0),
            }),
        }
    }

    pub fn settings(&self) -> CloudQueueSettings {
        self.inner.settings
    }

    /// Makes the next `count` connection attempts fail with a transient error.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn visible_count(&self, queue: &str) -> usize {
        self.queues().get(queue).map_or(0, |q| q.visible.len())
    }

    pub fn in_flight_count(&self, queue: &str) -> usize {
        self.queues().get(queue).map_or(0, |q| q.in_flight.len())
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<RawMessage> {
        self.queues()
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, CloudQueueState>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn dial(&self) -> Result<(), BrokerError> {
        if self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BrokerError::ConnectFailed("queue service unreachable".into()));
        }
        Ok(())
    }

    fn send(&self, queue: &str, message: RawMessage) -> Result<(), BrokerError> {
        let max_depth = self.inner.settings.max_queue_depth;
        let mut queues = self.queues();
        let state = queues.entry(queue.to_string()).or_default();
        if state.visible.len() + state.in_flight.len() >= max_depth {
            warn!(queue, max_depth, "Queue full, send rejected");
            return Err(BrokerError::Publish(format!(
                "queue '{queue}' is full ({max_depth} messages)"
            )));
        }
        state.visible.push_back(CloudMessage {
            message,
            receive_count: 0,
        });
        Ok(())
    }

    /// Receives one visible message, hiding it for the visibility timeout.
    fn receive(&self, queue: &str) -> Option<(RawMessage, u32, u64)> {
        let max_receive_count = self.inner.settings.max_receive_count;
        let now = Instant::now();
        let mut queues = self.queues();
        let state = queues.get_mut(queue)?;

        let expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(in_flight) = state.in_flight.remove(&receipt) {
                debug!(queue, message_id = %in_flight.entry.message.message_id, "Visibility timeout expired");
                release(queue, state, in_flight.entry, max_receive_count);
            }
        }

        let mut entry = state.visible.pop_front()?;
        entry.receive_count += 1;
        let receipt = self.inner.next_receipt.fetch_add(1, Ordering::Relaxed);
        let message = entry.message.clone();
        let receive_count = entry.receive_count;
        state.in_flight.insert(
            receipt,
            InFlight {
                entry,
                visible_at: now + self.inner.settings.visibility_timeout,
            },
        );
        Some((message, receive_count, receipt))
    }

    fn delete(&self, queue: &str, receipt: u64) {
        if let Some(state) = self.queues().get_mut(queue) {
            if state.in_flight.remove(&receipt).is_none() {
                debug!(queue, receipt, "Delete for expired receipt ignored");
            }
        }
    }

    fn return_message(&self, queue: &str, receipt: u64, requeue: bool) {
        let max_receive_count = self.inner.settings.max_receive_count;
        let mut queues = self.queues();
        let Some(state) = queues.get_mut(queue) else {
            return;
        };
        let Some(in_flight) = state.in_flight.remove(&receipt) else {
            return;
        };
        if requeue {
            release(queue, state, in_flight.entry, max_receive_count);
        } else {
            warn!(queue, message_id = %in_flight.entry.message.message_id, "Message dead-lettered");
            state.dead_letters.push(in_flight.entry.message);
        }
    }
}

/// Makes `entry` visible again, or dead-letters it under the redrive policy.
fn release(queue: &str, state: &mut CloudQueueState, entry: CloudMessage, max_receive_count: u32) {
    if entry.receive_count >= max_receive_count {
        warn!(
            queue,
            message_id = %entry.message.message_id,
            receive_count = entry.receive_count,
            "Receive count exceeded, message dead-lettered"
        );
        state.dead_letters.push(entry.message);
    } else {
        state.visible.push_back(entry);
    }
}

struct CloudAcker {
    service: CloudQueue,
    queue: String,
}

#[async_trait]
impl Acknowledger for CloudAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.service.delete(&self.queue, delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.service.return_message(&self.queue, delivery_tag, requeue);
        Ok(())
    }
}

pub struct CloudQueueTransport {
    service: CloudQueue,
}

impl CloudQueueTransport {
    /// Attaches to the in-process queue `service`. Only `memory://` endpoints are accepted.
    #[instrument(skip(service, config), fields(endpoint = %config.connection_string))]
    pub async fn connect(
        service: CloudQueue,
        config: &BrokerEndpointConfig,
    ) -> Result<Self, BrokerError> {
        let endpoint = config.connection_string.as_str();
        if config.scheme()? != EndpointScheme::InProcess {
            return Err(BrokerError::InvalidConfig(format!(
                "in-process cloud queue expects {IN_PROCESS_SCHEME}, got '{endpoint}'"
            )));
        }

        connect_with_retry(config.retry_policy(), endpoint, || service.dial()).await?;
        Ok(Self { service })
    }

    pub fn service(&self) -> &CloudQueue {
        &self.service
    }
}

#[async_trait]
impl BrokerTransport for CloudQueueTransport {
    async fn publish(&self, queue: &str, message: RawMessage) -> Result<(), BrokerError> {
        check_queue(queue)?;
        debug!(queue, message_id = %message.message_id, "Sending message");
        self.service.send(queue, message)
    }

    async fn subscribe(
        &self,
        queue: &str,
        concurrency_limit: usize,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        check_queue(queue)?;
        Ok(Box::new(CloudQueueSubscription {
            service: self.service.clone(),
            queue: queue.to_string(),
            cycles: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            acker: Arc::new(CloudAcker {
                service: self.service.clone(),
                queue: queue.to_string(),
            }),
            closed: false,
        }))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::CloudQueue
    }
}

struct CloudQueueSubscription {
    service: CloudQueue,
    queue: String,
    cycles: Arc<Semaphore>,
    acker: Arc<CloudAcker>,
    closed: bool,
}

#[async_trait]
impl Subscription for CloudQueueSubscription {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        if self.closed {
            return None;
        }
        let cycle = self.cycles.clone().acquire_owned().await.ok()?;
        let poll_interval = self.service.inner.settings.poll_interval;

        loop {
            if let Some((message, receive_count, receipt)) = self.service.receive(&self.queue) {
                let acker: Arc<dyn Acknowledger> = self.acker.clone();
                return Some(Delivery::new(message, receive_count, receipt, acker).with_credit(cycle));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn close(&mut self) {
        // In-flight messages come back through the visibility timeout.
        self.closed = true;
        self.cycles.close();
    }
}
