//! # HTTP Surface
//!
//! | Route | Handler |
//! |-------|---------|
//! | `POST /order` | [`order::create_order`] |
//! | `GET /order` | [`order::list_orders`] |
//! | `GET /basket` | [`basket::list_buyers`] |
//! | `POST /basket` | [`basket::update_basket`] |
//! | `GET /basket/{id}` | [`basket::get_basket`] |
//! | `DELETE /basket/{id}` | [`basket::delete_basket`] |
//! | `POST /basket/checkout` | [`basket::checkout`] |
//!
//! Handlers read an inbound `traceparent` (plus `baggage-*`) header when present and
//! continue that trace; otherwise the publisher starts a new one.

pub mod basket;
pub mod error;
pub mod order;

pub use error::ApiError;

use crate::basket::{BasketRepository, CheckoutService};
use crate::publisher::OrderPublisher;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use broker_framework::trace::{self, Headers, BAGGAGE_HEADER_PREFIX, TRACEPARENT_HEADER};
use broker_framework::TraceContext;

#[derive(Clone)]
pub struct AppState {
    pub publisher: OrderPublisher,
    pub baskets: BasketRepository,
    pub checkout: CheckoutService,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/order", post(order::create_order).get(order::list_orders))
        .route("/basket", get(basket::list_buyers).post(basket::update_basket))
        .route("/basket/checkout", post(basket::checkout))
        .route(
            "/basket/{id}",
            get(basket::get_basket).delete(basket::delete_basket),
        )
        .with_state(state)
}

/// Value of a header as UTF-8, if present.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// The caller's trace context, if the request carried a valid `traceparent`.
pub(crate) fn inbound_trace(headers: &HeaderMap) -> Option<TraceContext> {
    let carried: Headers = headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name == TRACEPARENT_HEADER || name.starts_with(BAGGAGE_HEADER_PREFIX)
        })
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    trace::extract_parent(&carried)
}
