#![doc(html_logo_url = "https://www.rust-lang.org/logos/rust-logo-128x128.png")]
#![doc(html_favicon_url = "https://www.rust-lang.org/favicon.ico")]
//! # Order Pipeline
//!
//! > **Orders in over HTTP, confirmations out through a message broker.**
//!
//! An HTTP front end publishes order commands and basket checkouts onto a broker queue;
//! a consumer picks the orders up and sends a confirmation email. A W3C trace context
//! and a correlation id travel inside every message, so one order can be followed end
//! to end.
//!
//! ## 🏗️ Design Philosophy
//!
//! ### One transport, two engines
//! Everything that touches the broker goes through the
//! [`BrokerTransport`](broker_framework::BrokerTransport) trait. The engine
//! (`queue-broker` or `cloud-queue`) is picked once from configuration and the rest of
//! the code never branches on it.
//!
//! ### At-least-once, on purpose
//! A delivery is acknowledged only after its handler returns `Ok`. Failures, panics and
//! abandoned handlers all end in redelivery, so handlers must tolerate duplicates.
//!
//! ## 👩‍💻 Architecture Notes
//!
//! ### 1. Type-Safe Error Handling
//! Each layer has its own `thiserror` enum ([`PublishOrderError`](publisher::PublishOrderError),
//! [`CheckoutError`](basket::CheckoutError), [`ApiError`](api::ApiError), ...). Conversions
//! use `#[from]`; only the binary reaches for `anyhow`.
//!
//! ### 2. Bounded Consumption
//! The [`ConsumerDispatcher`](broker_framework::ConsumerDispatcher) never runs more handlers
//! than `CONSUMER_CONCURRENCY_LIMIT`, and the broker never hands out more unacknowledged
//! messages than `BROKER_PREFETCH_COUNT`.
//!
//! ### 3. Observability
//! `tracing` everywhere, initialised by [`lifecycle::tracing`]. The consumer's span carries
//! the trace id of the message it is handling.
//!
//! ## 🗺️ Module Tour
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | Environment configuration |
//! | [`model`] | Order, notification and basket data |
//! | [`correlation`] | Request and correlation ids |
//! | [`publisher`] | Publishes order commands |
//! | [`basket`] | Basket cache repository and checkout |
//! | [`consumers`] | Order consumer and email service |
//! | [`api`] | axum routes |
//! | [`lifecycle`] | Startup, shutdown and logging |
//!
//! The broker abstractions live in the `broker-framework` workspace crate.

pub mod api;
pub mod basket;
pub mod config;
pub mod consumers;
pub mod correlation;
pub mod lifecycle;
pub mod model;
pub mod publisher;
