use super::{header_str, inbound_trace, ApiError, AppState};
use crate::correlation::REQUEST_ID_HEADER;
use crate::model::{BasketCheckout, CustomerBasket};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use tracing::info;

/// Header naming the buyer whose basket is checked out; falls back to the body's `buyer`.
pub const BUYER_ID_HEADER: &str = "x-buyer-id";

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub request_id: String,
}

pub async fn list_buyers(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.baskets.buyer_ids().await?))
}

pub async fn get_basket(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CustomerBasket>, ApiError> {
    info!(buyer_id = %id, "Get basket by id");
    Ok(Json(state.baskets.get(&id).await?))
}

pub async fn update_basket(
    State(state): State<AppState>,
    payload: Result<Json<CustomerBasket>, JsonRejection>,
) -> Result<Json<CustomerBasket>, ApiError> {
    let Json(basket) = payload?;
    info!(buyer_id = %basket.buyer_id, "Update basket");
    Ok(Json(state.baskets.update(basket).await?))
}

pub async fn delete_basket(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = state.baskets.delete(&id).await?;
    Ok(Json(DeleteResponse { deleted }))
}

/// `POST /basket/checkout`: 202 once the checkout is published, 400 without a basket.
pub async fn checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<BasketCheckout>, JsonRejection>,
) -> Result<(StatusCode, Json<CheckoutResponse>), ApiError> {
    let Json(request) = payload?;
    let buyer_id = header_str(&headers, BUYER_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| request.buyer.clone());
    let inbound = inbound_trace(&headers);

    let accepted = state
        .checkout
        .checkout(
            request,
            &buyer_id,
            header_str(&headers, REQUEST_ID_HEADER),
            inbound.as_ref(),
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CheckoutResponse {
            request_id: accepted.request_id.to_string(),
        }),
    ))
}
