//! HTTP error mapping.

use crate::basket::{BasketError, CheckoutError};
use crate::publisher::PublishOrderError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Errors that cross the HTTP boundary. Internal detail stays in the logs.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PublishOrderError> for ApiError {
    fn from(e: PublishOrderError) -> Self {
        match e {
            PublishOrderError::Validation(msg) => ApiError::BadRequest(msg),
            PublishOrderError::Publish(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<BasketError> for ApiError {
    fn from(e: BasketError) -> Self {
        match e {
            BasketError::Invalid(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<CheckoutError> for ApiError {
    fn from(e: CheckoutError) -> Self {
        match e {
            CheckoutError::BasketNotFound(_) | CheckoutError::Invalid(_) => {
                ApiError::BadRequest(e.to_string())
            }
            CheckoutError::Publish(_) | CheckoutError::Store(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}
