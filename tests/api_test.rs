use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use broker_framework::mock::MockTransport;
use broker_framework::message::CORRELATION_ID_HEADER;
use broker_framework::trace::{self, TRACEPARENT_HEADER};
use broker_framework::{BrokerError, MessageEnvelope, TraceContext};
use http_body_util::BodyExt;
use order_pipeline::api::{router, AppState};
use order_pipeline::basket::{BasketRepository, CheckoutService, InMemoryStore};
use order_pipeline::model::{CheckoutAccepted, OrderCommand};
use order_pipeline::publisher::OrderPublisher;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const ORDER_QUEUE: &str = "order-queue";
const CHECKOUT_QUEUE: &str = "basket-checkout-queue";

fn app(mock: &MockTransport) -> Router {
    let transport = Arc::new(mock.clone());
    let baskets = BasketRepository::new(Arc::new(InMemoryStore::new()));
    router(AppState {
        publisher: OrderPublisher::new(transport.clone(), ORDER_QUEUE),
        checkout: CheckoutService::new(baskets.clone(), transport, CHECKOUT_QUEUE),
        baskets,
    })
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

// --- Orders ---

#[tokio::test]
async fn test_post_order_publishes_command() {
    let mock = MockTransport::new();
    mock.expect_publish(ORDER_QUEUE).return_ok();
    let app = app(&mock);

    let (status, body) = send(
        &app,
        json_request("POST", "/order", json!({ "orderAmount": 12.0, "orderNumber": "N-1" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    mock.verify();
    let published = mock.published(ORDER_QUEUE);
    assert_eq!(published.len(), 1);

    let envelope = MessageEnvelope::<OrderCommand>::decode(&published[0]).unwrap();
    assert_eq!(envelope.payload.order_number, "N-1");
    assert_eq!(body["orderId"], envelope.payload.order_id.to_string());
    assert_eq!(body["correlationId"], envelope.correlation_id);
    assert_eq!(
        body["traceId"],
        trace::extract(&published[0].headers).trace_id().to_string()
    );
}

#[tokio::test]
async fn test_post_order_continues_inbound_trace() {
    let mock = MockTransport::new();
    mock.expect_publish(ORDER_QUEUE).return_ok();
    let app = app(&mock);
    let parent = TraceContext::new_root();

    let request = Request::builder()
        .method("POST")
        .uri("/order")
        .header("content-type", "application/json")
        .header(TRACEPARENT_HEADER, parent.traceparent())
        .body(Body::from(json!({ "orderAmount": 1.0, "orderNumber": "N-2" }).to_string()))
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["traceId"], parent.trace_id().to_string());
    let carried = trace::extract(&mock.published(ORDER_QUEUE)[0].headers);
    assert_eq!(carried.trace_id(), parent.trace_id());
    assert_ne!(carried.span_id(), parent.span_id());
}

#[tokio::test]
async fn test_post_order_replaces_malformed_request_id() {
    let mock = MockTransport::new();
    mock.expect_publish(ORDER_QUEUE).return_ok();
    let app = app(&mock);

    let request = Request::builder()
        .method("POST")
        .uri("/order")
        .header("content-type", "application/json")
        .header("x-requestid", "not-a-uuid")
        .body(Body::from(json!({ "orderAmount": 2.0, "orderNumber": "N-5" }).to_string()))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    let published = mock.published(ORDER_QUEUE);
    let correlation_id = published[0].header(CORRELATION_ID_HEADER).unwrap();
    assert_ne!(correlation_id, "not-a-uuid");
    let parsed = Uuid::parse_str(correlation_id).unwrap();
    assert!(!parsed.is_nil());
    assert_eq!(body["correlationId"], correlation_id);
}

#[tokio::test]
async fn test_invalid_order_is_rejected_without_publishing() {
    let mock = MockTransport::new();
    let app = app(&mock);

    let (status, body) = send(
        &app,
        json_request("POST", "/order", json!({ "orderAmount": -1.0, "orderNumber": "N-3" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("orderAmount"));

    let (status, _) = send(
        &app,
        json_request("POST", "/order", json!({ "orderAmount": "lots" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(mock.published(ORDER_QUEUE).is_empty());
}

#[tokio::test]
async fn test_broker_failure_is_internal_error() {
    let mock = MockTransport::new();
    mock.expect_publish(ORDER_QUEUE)
        .return_err(BrokerError::Publish("connection reset".into()));
    let app = app(&mock);

    let (status, body) = send(
        &app,
        json_request("POST", "/order", json!({ "orderAmount": 5.0, "orderNumber": "N-4" })),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Internal server error");
    mock.verify();
}

#[tokio::test]
async fn test_get_orders_is_empty() {
    let mock = MockTransport::new();
    let (status, body) = send(&app(&mock), get("/order")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

// --- Baskets ---

#[tokio::test]
async fn test_unknown_basket_is_empty() {
    let mock = MockTransport::new();
    let (status, body) = send(&app(&mock), get("/basket/nobody")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "buyerId": "nobody", "items": [] }));
}

#[tokio::test]
async fn test_basket_update_list_and_delete() {
    let mock = MockTransport::new();
    let app = app(&mock);
    let basket = json!({
        "buyerId": "grace",
        "items": [{ "productId": "p-9", "unitPrice": 4.0, "quantity": 1 }]
    });

    let (status, _) = send(&app, json_request("POST", "/basket", basket)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, buyers) = send(&app, get("/basket")).await;
    assert_eq!(buyers, json!(["grace"]));

    let delete = Request::builder()
        .method("DELETE")
        .uri("/basket/grace")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, delete).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "deleted": true }));

    let delete_again = Request::builder()
        .method("DELETE")
        .uri("/basket/grace")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&app, delete_again).await;
    assert_eq!(body, json!({ "deleted": false }));
}

#[tokio::test]
async fn test_invalid_basket_is_rejected() {
    let mock = MockTransport::new();
    let (status, _) = send(
        &app(&mock),
        json_request("POST", "/basket", json!({ "buyerId": " ", "items": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_checkout_without_basket_is_bad_request() {
    let mock = MockTransport::new();
    let (status, _) = send(
        &app(&mock),
        json_request("POST", "/basket/checkout", json!({ "buyer": "nobody" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(mock.published(CHECKOUT_QUEUE).is_empty());
}

#[tokio::test]
async fn test_checkout_uses_request_id_header() {
    let mock = MockTransport::new();
    mock.expect_publish(CHECKOUT_QUEUE).return_ok();
    let app = app(&mock);
    let basket = json!({
        "buyerId": "linus",
        "items": [{ "productId": "p-1", "unitPrice": 10.0, "quantity": 2 }]
    });
    send(&app, json_request("POST", "/basket", basket)).await;

    let request_id = uuid::Uuid::new_v4();
    let request = Request::builder()
        .method("POST")
        .uri("/basket/checkout")
        .header("content-type", "application/json")
        .header("x-requestid", request_id.to_string())
        .header("x-buyer-id", "linus")
        .body(Body::from(json!({ "buyer": "Linus", "city": "Helsinki" }).to_string()))
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["requestId"], request_id.to_string());

    let published = mock.published(CHECKOUT_QUEUE);
    let envelope = MessageEnvelope::<CheckoutAccepted>::decode(&published[0]).unwrap();
    assert_eq!(envelope.payload.buyer_id, "linus");
    assert_eq!(envelope.payload.request_id, request_id);
    assert_eq!(envelope.correlation_id, request_id.to_string());
    assert_eq!(envelope.payload.basket.total(), 20.0);

    let (_, basket) = send(&app, get("/basket/linus")).await;
    assert_eq!(basket["items"], json!([]));
}
