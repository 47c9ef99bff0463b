//! # Consumer Dispatcher
//!
//! Runs a [`MessageHandler`] against a queue with a bounded concurrency window.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --start()--> Running --stop()--> Draining --(drained | timeout)--> Stopped
//! ```
//!
//! - **Running**: a pump task pulls deliveries and spawns one task per delivery. At most
//!   `concurrency_limit` handlers execute at once.
//! - **Draining**: no new deliveries are pulled; in-flight handlers get `stop_timeout`
//!   to finish. Whatever is still running afterwards is abandoned and its message is
//!   redelivered by the broker once the subscription closes.
//!
//! ## Failure isolation
//!
//! Every handler runs in its own task. An error or a panic in one handler nacks that
//! delivery for redelivery and never affects the others. Undecodable payloads are
//! nacked without requeue since no amount of retrying will fix them.

use crate::config::BrokerEndpointConfig;
use crate::error::BrokerError;
use crate::handler::{HandlerContext, MessageHandler};
use crate::message::{Delivery, MessageEnvelope};
use crate::transport::{BrokerTransport, Subscription};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Snapshot of a dispatcher's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Deliveries whose handler returned `Ok` (acked).
    pub processed: u64,
    /// Deliveries whose handler failed or panicked (nacked for redelivery).
    pub failed: u64,
    /// Deliveries that could not be decoded (dead-lettered).
    pub rejected: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Counters {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}

struct InFlightGuard(Arc<Counters>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

type PumpOutput = (Box<dyn Subscription>, JoinSet<()>);

/// Subscribes a handler to a queue and feeds it deliveries.
pub struct ConsumerDispatcher<H: MessageHandler> {
    transport: Arc<dyn BrokerTransport>,
    handler: Arc<H>,
    queue: String,
    concurrency_limit: usize,
    stop_timeout: Duration,
    state: DispatcherState,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<PumpOutput>>,
}

impl<H: MessageHandler> ConsumerDispatcher<H> {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        handler: Arc<H>,
        config: &BrokerEndpointConfig,
    ) -> Self {
        Self {
            transport,
            handler,
            queue: config.queue_name.clone(),
            concurrency_limit: config.concurrency_limit.max(1),
            stop_timeout: config.stop_timeout,
            state: DispatcherState::Idle,
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
            pump: None,
        }
    }

    /// Consumes `queue` instead of the configured one.
    pub fn for_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }

    /// Subscribes and starts pulling deliveries. Only valid from `Idle`.
    pub async fn start(&mut self) -> Result<(), BrokerError> {
        if self.state != DispatcherState::Idle {
            return Err(BrokerError::InvalidState(format!(
                "cannot start a dispatcher in state {:?}",
                self.state
            )));
        }

        let subscription = self
            .transport
            .subscribe(&self.queue, self.concurrency_limit)
            .await?;

        let pump = Pump {
            subscription,
            handler: self.handler.clone(),
            queue: self.queue.clone(),
            slots: Arc::new(Semaphore::new(self.concurrency_limit)),
            counters: self.counters.clone(),
            cancel: self.cancel.clone(),
        };
        self.pump = Some(tokio::spawn(pump.run()));
        self.state = DispatcherState::Running;

        info!(
            queue = %self.queue,
            transport = %self.transport.kind(),
            concurrency_limit = self.concurrency_limit,
            "Consumer dispatcher started"
        );
        Ok(())
    }

    /// Stops pulling, drains in-flight handlers up to the stop timeout, then closes the
    /// subscription. Stopping an idle dispatcher just marks it stopped.
    pub async fn stop(&mut self) -> Result<(), BrokerError> {
        match self.state {
            DispatcherState::Running => {}
            DispatcherState::Idle => {
                self.state = DispatcherState::Stopped;
                return Ok(());
            }
            other => {
                return Err(BrokerError::InvalidState(format!(
                    "cannot stop a dispatcher in state {other:?}"
                )));
            }
        }

        // 1. Stop pulling
        self.state = DispatcherState::Draining;
        self.cancel.cancel();
        let Some(pump) = self.pump.take() else {
            self.state = DispatcherState::Stopped;
            return Ok(());
        };
        let (mut subscription, mut tasks) = match pump.await {
            Ok(parts) => parts,
            Err(e) => {
                self.state = DispatcherState::Stopped;
                return Err(BrokerError::InvalidState(format!("pump task failed: {e}")));
            }
        };

        // 2. Drain in-flight handlers
        let in_flight = tasks.len();
        debug!(queue = %self.queue, in_flight, "Draining in-flight handlers");
        if tokio::time::timeout(self.stop_timeout, drain(&mut tasks))
            .await
            .is_err()
        {
            warn!(
                queue = %self.queue,
                abandoned = tasks.len(),
                stop_timeout_ms = self.stop_timeout.as_millis() as u64,
                "Stop timeout elapsed, abandoning in-flight handlers"
            );
            tasks.detach_all();
        }

        // 3. Release the subscription; unsettled deliveries go back to the broker
        subscription.close().await;
        self.state = DispatcherState::Stopped;

        let stats = self.stats();
        info!(
            queue = %self.queue,
            processed = stats.processed,
            failed = stats.failed,
            rejected = stats.rejected,
            "Consumer dispatcher stopped"
        );
        Ok(())
    }
}

impl<H: MessageHandler> Drop for ConsumerDispatcher<H> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Dispatch task failed");
        }
    }
}

struct Pump<H: MessageHandler> {
    subscription: Box<dyn Subscription>,
    handler: Arc<H>,
    queue: String,
    slots: Arc<Semaphore>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl<H: MessageHandler> Pump<H> {
    async fn run(mut self) -> PumpOutput {
        let mut tasks = JoinSet::new();

        loop {
            // Reap finished tasks first, then wait for a free slot.
            let slot = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        error!(queue = %self.queue, error = %e, "Dispatch task failed");
                    }
                    continue;
                }
                slot = self.slots.clone().acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                delivery = self.subscription.next_delivery() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            tasks.spawn(dispatch_one(
                self.handler.clone(),
                delivery,
                self.queue.clone(),
                self.counters.clone(),
                slot,
            ));
        }

        (self.subscription, tasks)
    }
}

async fn dispatch_one<H: MessageHandler>(
    handler: Arc<H>,
    delivery: Delivery,
    queue: String,
    counters: Arc<Counters>,
    _slot: OwnedSemaphorePermit,
) {
    let _in_flight = counters.enter();
    let message_id = delivery.message().message_id.clone();

    // 1. Decode
    let envelope = match MessageEnvelope::<H::Message>::decode(delivery.message()) {
        Ok(envelope) => envelope,
        Err(e) => {
            counters.rejected.fetch_add(1, Ordering::SeqCst);
            error!(
                queue = %queue,
                message_id = %message_id,
                correlation_id = delivery.message().correlation_id().unwrap_or_default(),
                error = %e,
                "Undecodable message rejected"
            );
            settle(delivery.nack(false).await, &queue, &message_id);
            return;
        }
    };

    // 2. Continue the producer's trace one hop down
    let trace = envelope.trace_context().child();
    let correlation_id = envelope.correlation_id.clone();
    let span = info_span!(
        "consume",
        queue = %queue,
        correlation_id = %correlation_id,
        trace_id = %trace.trace_id(),
        span_id = %trace.span_id(),
        attempt = delivery.attempt(),
    );
    let ctx = HandlerContext {
        trace,
        correlation_id: correlation_id.clone(),
        message_id: message_id.clone(),
        attempt: delivery.attempt(),
        queue: queue.clone(),
    };

    // 3. Run the handler in its own task so a panic stays contained
    let payload = envelope.payload;
    let outcome = tokio::spawn(
        async move { handler.handle(payload, ctx).await }.instrument(span.clone()),
    )
    .await;

    // 4. Settle
    async move {
        match outcome {
            Ok(Ok(())) => {
                counters.processed.fetch_add(1, Ordering::SeqCst);
                debug!(message_id = %message_id, "Message handled");
                settle(delivery.ack().await, &queue, &message_id);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    correlation_id = %correlation_id,
                    message_id = %message_id,
                    error = %e,
                    "Handler failed, message will be redelivered"
                );
                settle(delivery.nack(true).await, &queue, &message_id);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    correlation_id = %correlation_id,
                    message_id = %message_id,
                    error = %e,
                    "Handler panicked, message will be redelivered"
                );
                settle(delivery.nack(true).await, &queue, &message_id);
            }
        }
    }
    .instrument(span)
    .await;
}

fn settle(result: Result<(), BrokerError>, queue: &str, message_id: &str) {
    if let Err(e) = result {
        warn!(queue, message_id, error = %e, "Failed to settle delivery");
    }
}
