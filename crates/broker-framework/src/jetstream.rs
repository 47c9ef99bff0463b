//! # JetStream Transport
//!
//! Both transport variants against a NATS server with JetStream enabled. This is what a
//! `nats://` or `tls://` connection string selects.
//!
//! ## Mapping
//!
//! - Each queue is a work-queue stream named after the queue, bound to the subject
//!   `pipeline.<stream>`. Streams are declared on first publish or subscribe and hold
//!   at most [`MAX_STREAM_MESSAGES`]; publishing to a full stream fails.
//! - Consumers share one durable pull consumer per stream, so a message goes to exactly
//!   one of them and survives consumer restarts.
//! - Queue-broker semantics: `max_ack_pending` is the prefetch count and a subscription
//!   holds at most `prefetch_count` unsettled deliveries.
//! - Cloud-queue semantics: `ack_wait` is the visibility timeout, `max_deliver` the
//!   receive count after which the server stops redelivering, and a subscription runs
//!   at most `concurrency_limit` receive cycles.
//! - `nack(requeue = true)` is a NAK (redeliver now), `nack(requeue = false)` a TERM.
//!   A delivery dropped unsettled is redelivered once `ack_wait` expires.

use crate::cloud_queue::CloudQueueSettings;
use crate::config::{BrokerEndpointConfig, EndpointScheme, TransportKind};
use crate::error::BrokerError;
use crate::message::{Acknowledger, Delivery, RawMessage};
use crate::queue_broker::{DEFAULT_MAX_DELIVERIES, DEFAULT_MAX_QUEUE_DEPTH};
use crate::retry::connect_with_retry;
use crate::trace::Headers;
use crate::transport::{check_queue, BrokerTransport, Subscription};
use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_nats::{ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

pub const SUBJECT_PREFIX: &str = "pipeline";
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
/// Publishes to a stream holding this many messages are refused by the server.
pub const MAX_STREAM_MESSAGES: i64 = DEFAULT_MAX_QUEUE_DEPTH as i64;

/// Header JetStream uses to drop duplicate publishes.
const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";

/// Stream name for `queue`: anything outside `[A-Za-z0-9_-]` becomes `_`.
pub fn stream_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn subject_for(queue: &str) -> String {
    format!("{SUBJECT_PREFIX}.{}", stream_name(queue))
}

fn consumer_name(queue: &str) -> String {
    format!("{}-consumers", stream_name(queue))
}

/// Durable pull consumer settings for `queue` under the semantics of `kind`.
pub fn consumer_config(
    kind: TransportKind,
    queue: &str,
    prefetch_count: u16,
    cloud: &CloudQueueSettings,
) -> consumer::pull::Config {
    let base = consumer::pull::Config {
        durable_name: Some(consumer_name(queue)),
        filter_subject: subject_for(queue),
        ack_policy: consumer::AckPolicy::Explicit,
        ..Default::default()
    };

    match kind {
        TransportKind::QueueBroker => consumer::pull::Config {
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: i64::from(DEFAULT_MAX_DELIVERIES),
            max_ack_pending: i64::from(prefetch_count.max(1)),
            ..base
        },
        TransportKind::CloudQueue => consumer::pull::Config {
            ack_wait: cloud.visibility_timeout,
            max_deliver: i64::from(cloud.max_receive_count.max(1)),
            ..base
        },
    }
}

pub(crate) fn to_nats_headers(message: &RawMessage) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &message.headers {
        headers.insert(name.as_str(), value.as_str());
    }
    headers.insert(MESSAGE_ID_HEADER, message.message_id.as_str());
    headers
}

/// Rebuilds a [`RawMessage`]. Falls back to `fallback_id` when the publisher set no id.
pub(crate) fn from_nats(headers: Option<&HeaderMap>, body: &[u8], fallback_id: String) -> RawMessage {
    let mut message_id = None;
    let mut converted = Headers::new();
    for (name, values) in headers.into_iter().flat_map(|h| h.iter()) {
        let Some(value) = values.first() else {
            continue;
        };
        let name = name.to_string();
        if name == MESSAGE_ID_HEADER {
            message_id = Some(value.to_string());
        } else {
            converted.insert(name, value.to_string());
        }
    }

    RawMessage {
        message_id: message_id.unwrap_or(fallback_id),
        headers: converted,
        body: body.to_vec(),
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct JetStreamTransport {
    context: jetstream::Context,
    kind: TransportKind,
    prefetch_count: u16,
    cloud: CloudQueueSettings,
    declared: Mutex<HashSet<String>>,
}

impl JetStreamTransport {
    pub async fn connect(config: &BrokerEndpointConfig) -> Result<Self, BrokerError> {
        Self::connect_with(config, CloudQueueSettings::default()).await
    }

    /// Dials the NATS server named by `config` with bounded retries. `cloud` supplies the
    /// visibility timeout and receive count used when `config` selects the cloud variant.
    #[instrument(skip(config, cloud), fields(endpoint = %config.connection_string, transport = %config.transport_kind))]
    pub async fn connect_with(
        config: &BrokerEndpointConfig,
        cloud: CloudQueueSettings,
    ) -> Result<Self, BrokerError> {
        let endpoint = config.connection_string.trim();
        if config.scheme()? != EndpointScheme::Nats {
            return Err(BrokerError::InvalidConfig(format!(
                "JetStream transport expects nats:// or tls://, got '{endpoint}'"
            )));
        }

        let client = connect_with_retry(config.retry_policy(), endpoint, || dial(endpoint)).await?;
        info!(endpoint, "Connected to NATS");

        Ok(Self {
            context: jetstream::new(client),
            kind: config.transport_kind,
            prefetch_count: config.prefetch_count.max(1),
            cloud,
            declared: Mutex::new(HashSet::new()),
        })
    }

    async fn ensure_stream(&self, queue: &str) -> Result<stream::Stream, BrokerError> {
        let name = stream_name(queue);
        let stream = self
            .context
            .get_or_create_stream(stream::Config {
                name: name.clone(),
                subjects: vec![subject_for(queue)],
                retention: stream::RetentionPolicy::WorkQueue,
                max_messages: MAX_STREAM_MESSAGES,
                discard: stream::DiscardPolicy::New,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Subscribe(format!("declaring stream '{name}': {e}")))?;

        let first = self
            .declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone());
        if first {
            debug!(queue, stream = %name, "Stream declared");
        }
        Ok(stream)
    }

    fn is_declared(&self, queue: &str) -> bool {
        self.declared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&stream_name(queue))
    }
}

async fn dial(endpoint: &str) -> Result<async_nats::Client, BrokerError> {
    ConnectOptions::new()
        .connection_timeout(CONNECTION_TIMEOUT)
        .connect(endpoint)
        .await
        .map_err(|e| BrokerError::ConnectFailed(e.to_string()))
}

#[async_trait]
impl BrokerTransport for JetStreamTransport {
    async fn publish(&self, queue: &str, message: RawMessage) -> Result<(), BrokerError> {
        check_queue(queue)?;
        if !self.is_declared(queue) {
            self.ensure_stream(queue)
                .await
                .map_err(|e| BrokerError::Publish(e.to_string()))?;
        }

        debug!(queue, message_id = %message.message_id, "Publishing message");
        let headers = to_nats_headers(&message);
        let ack = self
            .context
            .publish_with_headers(subject_for(queue), headers, message.body.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        ack.await.map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        concurrency_limit: usize,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        check_queue(queue)?;
        let stream = self.ensure_stream(queue).await?;
        let config = consumer_config(self.kind, queue, self.prefetch_count, &self.cloud);
        let name = consumer_name(queue);

        let consumer = stream
            .get_or_create_consumer(&name, config)
            .await
            .map_err(|e| BrokerError::Subscribe(format!("consumer '{name}': {e}")))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| BrokerError::Subscribe(format!("consumer '{name}': {e}")))?
            .map(|item| item.map_err(|e| e.to_string()))
            .boxed();

        let credits = match self.kind {
            TransportKind::QueueBroker => self.prefetch_count as usize,
            TransportKind::CloudQueue => concurrency_limit.max(1),
        };
        debug!(queue, consumer = %name, credits, "Subscribed");

        Ok(Box::new(JetStreamSubscription {
            queue: queue.to_string(),
            messages: Some(messages),
            credits: Arc::new(Semaphore::new(credits)),
            next_tag: 1,
        }))
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

// ============================================================================
// Subscription
// ============================================================================

struct JetStreamSubscription {
    queue: String,
    messages: Option<BoxStream<'static, Result<jetstream::Message, String>>>,
    credits: Arc<Semaphore>,
    next_tag: u64,
}

#[async_trait]
impl Subscription for JetStreamSubscription {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        let credit = self.credits.clone().acquire_owned().await.ok()?;

        loop {
            let message = match self.messages.as_mut()?.next().await? {
                Ok(message) => message,
                Err(e) => {
                    warn!(queue = %self.queue, "Pull consumer error: {e}");
                    continue;
                }
            };

            let tag = self.next_tag;
            self.next_tag += 1;
            let (attempt, sequence) = match message.info() {
                Ok(info) => (
                    u32::try_from(info.delivered).unwrap_or(1).max(1),
                    info.stream_sequence,
                ),
                Err(_) => (1, tag),
            };
            let raw = from_nats(
                message.message.headers.as_ref(),
                &message.message.payload,
                format!("{}-{sequence}", stream_name(&self.queue)),
            );

            let acker: Arc<dyn Acknowledger> = Arc::new(JetStreamAcker {
                message: Mutex::new(Some(message)),
            });
            return Some(Delivery::new(raw, attempt, tag, acker).with_credit(credit));
        }
    }

    async fn close(&mut self) {
        // Unsettled messages come back once their ack wait runs out.
        self.messages = None;
        self.credits.close();
        debug!(queue = %self.queue, "Subscription closed");
    }
}

/// Settles the single JetStream message behind one delivery.
struct JetStreamAcker {
    message: Mutex<Option<jetstream::Message>>,
}

impl JetStreamAcker {
    fn take(&self) -> Option<jetstream::Message> {
        self.message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Acknowledger for JetStreamAcker {
    async fn ack(&self, _delivery_tag: u64) -> Result<(), BrokerError> {
        match self.take() {
            Some(message) => message
                .ack()
                .await
                .map_err(|e| BrokerError::Settle(e.to_string())),
            None => Ok(()),
        }
    }

    async fn nack(&self, _delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
        match self.take() {
            Some(message) => message
                .ack_with(kind)
                .await
                .map_err(|e| BrokerError::Settle(e.to_string())),
            None => Ok(()),
        }
    }
}
