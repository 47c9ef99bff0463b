//! # Observability & Tracing
//!
//! [`setup_tracing`] initializes structured logging for the whole process. Log lines are
//! compact and omit the module path; verbosity comes from `RUST_LOG`.
//!
//! ```bash
//! # Compact logs
//! RUST_LOG=info cargo run
//!
//! # Full payloads at entry points
//! RUST_LOG=debug cargo run
//!
//! # Only the broker framework, verbosely
//! RUST_LOG=broker_framework=trace cargo run
//! ```
//!
//! ## Two kinds of trace
//!
//! `tracing` spans describe work inside one process. The distributed trace travels with
//! each message in its `traceparent` header and shows up on the consumer's `consume`
//! span as `trace_id` and `span_id` fields, so one order can be followed from the HTTP
//! request to the email:
//!
//! ```text
//! INFO submit: Order published order_id=… correlation_id=… trace_id=4bf92f35…
//! INFO consume: Consume order message order_id=… attempt=1 trace_id=4bf92f35…
//! INFO consume: Email sent notification_id=… address="orders@localhost"
//! ```
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}
