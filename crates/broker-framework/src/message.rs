//! # Messages & Deliveries
//!
//! This module defines the unit moved across the broker and the handle a consumer
//! uses to settle it.
//!
//! - [`MessageEnvelope`]: headers + typed payload + correlation id (producer/consumer view)
//! - [`RawMessage`]: the encoded envelope as the transports see it
//! - [`Delivery`]: one delivery attempt of a [`RawMessage`], settled exactly once with
//!   [`Delivery::ack`] or [`Delivery::nack`]

use crate::error::BrokerError;
use crate::trace::{self, Headers, TraceContext};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use uuid::Uuid;

/// Header carrying the correlation id of the envelope.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Header naming the payload type, for routing and logs.
pub const MESSAGE_TYPE_HEADER: &str = "x-message-type";

/// An encoded envelope: what a broker actually stores and delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub message_id: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RawMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(CORRELATION_ID_HEADER)
    }
}

/// The header+payload unit exchanged over the broker.
///
/// Owned by whichever side currently holds it; never shared concurrently.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope<P> {
    pub headers: Headers,
    pub payload: P,
    pub correlation_id: String,
}

impl<P> MessageEnvelope<P> {
    /// Wraps `payload`, injecting `trace` and the correlation id into the headers.
    pub fn new(payload: P, correlation_id: impl Into<String>, trace: &TraceContext) -> Self {
        let correlation_id = correlation_id.into();
        let mut headers = trace::inject(trace);
        headers.insert(CORRELATION_ID_HEADER.to_string(), correlation_id.clone());
        Self {
            headers,
            payload,
            correlation_id,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The trace context carried by the headers, or a new root.
    pub fn trace_context(&self) -> TraceContext {
        trace::extract(&self.headers)
    }
}

impl<P: Serialize> MessageEnvelope<P> {
    /// Serializes the payload as JSON and assigns a fresh message id.
    pub fn encode(&self) -> Result<RawMessage, BrokerError> {
        Ok(RawMessage {
            message_id: Uuid::new_v4().to_string(),
            headers: self.headers.clone(),
            body: serde_json::to_vec(&self.payload)?,
        })
    }
}

impl<P: DeserializeOwned> MessageEnvelope<P> {
    pub fn decode(raw: &RawMessage) -> Result<Self, BrokerError> {
        let payload = serde_json::from_slice(&raw.body)?;
        Ok(Self {
            headers: raw.headers.clone(),
            payload,
            correlation_id: raw.correlation_id().unwrap_or_default().to_string(),
        })
    }
}

/// Settles deliveries on behalf of a transport.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirms processing; the message is not redelivered.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Rejects processing. With `requeue` the broker may redeliver the message,
    /// without it the message goes to the dead-letter store.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

/// One delivery attempt of a message.
///
/// Consuming methods guarantee a delivery is settled at most once. A delivery that is
/// dropped unsettled stays unacknowledged and is eventually redelivered by the broker.
pub struct Delivery {
    message: RawMessage,
    attempt: u32,
    tag: u64,
    acker: Arc<dyn Acknowledger>,
    _credit: Option<OwnedSemaphorePermit>,
}

impl Delivery {
    pub fn new(message: RawMessage, attempt: u32, tag: u64, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            message,
            attempt,
            tag,
            acker,
            _credit: None,
        }
    }

    /// Ties a flow-control permit to this delivery; it is released on settle or drop.
    pub fn with_credit(mut self, credit: OwnedSemaphorePermit) -> Self {
        self._credit = Some(credit);
        self
    }

    pub fn message(&self) -> &RawMessage {
        &self.message
    }

    /// 1 for the first delivery, incremented on each redelivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack(self.tag).await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(self.tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message.message_id)
            .field("attempt", &self.attempt)
            .field("tag", &self.tag)
            .finish()
    }
}
