//! # Order Publisher
//!
//! The producer side of the pipeline. It turns a validated [`OrderRequest`] into an
//! [`OrderCommand`] envelope, continues or starts the distributed trace, and hands the
//! envelope to the broker.
//!
//! The call returns as soon as the broker accepts the envelope; processing happens
//! later on the consumer side.

mod error;

pub use error::PublishOrderError;

use crate::correlation::resolve_correlation_id;
use crate::model::{OrderCommand, OrderId, OrderRequest};
use broker_framework::message::MESSAGE_TYPE_HEADER;
use broker_framework::{BrokerTransport, MessageEnvelope, TraceContext, TraceId};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn, Span};

/// What the caller gets back once the order is on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub order_id: OrderId,
    pub correlation_id: String,
    pub trace_id: TraceId,
}

#[derive(Clone)]
pub struct OrderPublisher {
    transport: Arc<dyn BrokerTransport>,
    queue: String,
}

impl OrderPublisher {
    pub fn new(transport: Arc<dyn BrokerTransport>, queue: impl Into<String>) -> Self {
        Self {
            transport,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Validates and publishes one order.
    ///
    /// `supplied_correlation_id` is reused when it is a non-nil UUID. `inbound` is the
    /// caller's trace context, if the request carried one; the published envelope then
    /// carries a child of it, otherwise a new root.
    #[instrument(
        skip(self, request, inbound),
        fields(queue = %self.queue, correlation_id = tracing::field::Empty)
    )]
    pub async fn submit(
        &self,
        request: OrderRequest,
        supplied_correlation_id: Option<&str>,
        inbound: Option<&TraceContext>,
    ) -> Result<Accepted, PublishOrderError> {
        debug!(?request, "submit called");

        // 1. Validate before touching the broker
        if let Err(reason) = request.validate() {
            warn!(%reason, "Order rejected");
            return Err(PublishOrderError::Validation(reason));
        }

        // 2. Correlation id and trace context
        let correlation_id = resolve_correlation_id(supplied_correlation_id);
        Span::current().record("correlation_id", correlation_id.as_str());
        let trace = match inbound {
            Some(parent) => parent.child(),
            None => TraceContext::new_root(),
        };

        // 3. Build and publish the envelope
        let command = OrderCommand::from_request(request, correlation_id.clone());
        let order_id = command.order_id;
        let order_number = command.order_number.clone();
        let raw = MessageEnvelope::new(command, correlation_id.clone(), &trace)
            .with_header(MESSAGE_TYPE_HEADER, OrderCommand::MESSAGE_TYPE)
            .encode()?;

        self.transport.publish(&self.queue, raw).await.map_err(|e| {
            warn!(%correlation_id, error = %e, "Order publish failed");
            PublishOrderError::Publish(e)
        })?;

        info!(
            %order_id,
            %order_number,
            %correlation_id,
            trace_id = %trace.trace_id(),
            "Order published"
        );
        Ok(Accepted {
            order_id,
            correlation_id,
            trace_id: trace.trace_id(),
        })
    }
}
