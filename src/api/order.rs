use super::{header_str, inbound_trace, ApiError, AppState};
use crate::correlation::REQUEST_ID_HEADER;
use crate::model::OrderRequest;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: String,
    pub correlation_id: String,
    pub trace_id: String,
}

/// `POST /order`: validates and publishes an order, answering once it is on the broker.
pub async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<OrderRequest>, JsonRejection>,
) -> Result<Json<OrderResponse>, ApiError> {
    let Json(request) = payload?;
    info!(
        order_amount = request.order_amount,
        order_number = %request.order_number,
        "Post order"
    );

    let inbound = inbound_trace(&headers);
    let accepted = state
        .publisher
        .submit(request, header_str(&headers, REQUEST_ID_HEADER), inbound.as_ref())
        .await?;

    Ok(Json(OrderResponse {
        order_id: accepted.order_id.to_string(),
        correlation_id: accepted.correlation_id,
        trace_id: accepted.trace_id.to_string(),
    }))
}

/// `GET /order`: orders are not stored on this side of the broker.
pub async fn list_orders() -> Json<Vec<String>> {
    info!("Get orders");
    Json(Vec::new())
}
