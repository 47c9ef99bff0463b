//! The consumer-side contract run by the [`ConsumerDispatcher`](crate::ConsumerDispatcher).

use crate::trace::TraceContext;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// What a handler knows about the delivery it is processing.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Child of the producer's context, one hop further down the trace.
    pub trace: TraceContext,
    pub correlation_id: String,
    pub message_id: String,
    /// 1 on first delivery; greater on redelivery.
    pub attempt: u32,
    pub queue: String,
}

/// Processes one decoded message.
///
/// Returning `Ok` acknowledges the delivery. Returning `Err` (or panicking) rejects it
/// and the broker redelivers it, so implementations must tolerate duplicates.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Message: DeserializeOwned + Debug + Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn handle(&self, message: Self::Message, ctx: HandlerContext) -> Result<(), Self::Error>;
}
