use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use broker_framework::trace::TRACEPARENT_HEADER;
use broker_framework::{BrokerHub, CloudQueue, QueueBroker, TraceContext};
use http_body_util::BodyExt;
use order_pipeline::basket::InMemoryStore;
use order_pipeline::config::AppConfig;
use order_pipeline::consumers::{EmailError, EmailService};
use order_pipeline::lifecycle::OrderSystem;
use order_pipeline::model::Notification;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;

/// Forwards every sent notification to the test; fails the first `failures` sends.
struct ChannelEmail {
    sent: mpsc::UnboundedSender<Notification>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl ChannelEmail {
    fn new(failures: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let email = Arc::new(Self {
            sent: tx,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        });
        (email, rx)
    }
}

#[async_trait]
impl EmailService for ChannelEmail {
    async fn send(&self, notification: &Notification) -> Result<(), EmailError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EmailError::Delivery {
                address: notification.address.clone(),
                reason: "mail relay unavailable".into(),
            });
        }
        let _ = self.sent.send(notification.clone());
        Ok(())
    }
}

async fn start(
    failures: usize,
) -> (
    OrderSystem<ChannelEmail>,
    QueueBroker,
    Arc<ChannelEmail>,
    mpsc::UnboundedReceiver<Notification>,
) {
    start_with(QueueBroker::new(), failures).await
}

async fn start_with(
    broker: QueueBroker,
    failures: usize,
) -> (
    OrderSystem<ChannelEmail>,
    QueueBroker,
    Arc<ChannelEmail>,
    mpsc::UnboundedReceiver<Notification>,
) {
    let config = AppConfig::from_lookup(|name| {
        (name == "BROKER_CONNECTION_STRING").then(|| "memory://".to_string())
    })
    .unwrap();
    let hub = BrokerHub::new(broker.clone(), CloudQueue::default());
    let (email, rx) = ChannelEmail::new(failures);
    let system = OrderSystem::start(&config, &hub, Arc::new(InMemoryStore::new()), email.clone())
        .await
        .expect("system should start");
    (system, broker, email, rx)
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

fn post(uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
}

fn json_body(body: Value) -> Body {
    Body::from(body.to_string())
}

async fn next_email(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no email was sent in time")
        .expect("email channel closed")
}

/// An order posted over HTTP comes out of the consumer as a confirmation email.
#[tokio::test]
async fn test_order_flows_from_http_to_email() {
    let (system, broker, email, mut rx) = start(0).await;
    let app = system.router();

    let parent = TraceContext::new_root();
    let request_id = uuid::Uuid::new_v4().to_string();
    let body = json!({ "orderAmount": 42.5, "orderNumber": "N-1001" });
    let (status, response) = send(
        &app,
        post("/order")
            .header("x-requestid", &request_id)
            .header(TRACEPARENT_HEADER, parent.traceparent())
            .body(json_body(body))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["correlationId"], request_id);
    assert_eq!(response["traceId"], parent.trace_id().to_string());
    assert!(response["orderId"].as_str().is_some());

    let sent = next_email(&mut rx).await;
    assert_eq!(sent.content, "Order: N-1001");
    assert_eq!(email.attempts.load(Ordering::SeqCst), 1);

    system.shutdown().await.unwrap();
    assert_eq!(broker.ready_count("order-queue"), 0);
    assert_eq!(broker.unacked_count("order-queue"), 0);
}

/// A failed email is retried through broker redelivery rather than lost.
#[tokio::test]
async fn test_failed_email_is_redelivered() {
    let (system, _broker, email, mut rx) = start(1).await;
    let app = system.router();

    let body = json!({ "orderAmount": 3.0, "orderNumber": "N-7" });
    let (status, _) = send(&app, post("/order").body(json_body(body)).unwrap()).await;
    assert_eq!(status, StatusCode::OK);

    let sent = next_email(&mut rx).await;
    assert_eq!(sent.content, "Order: N-7");
    assert_eq!(email.attempts.load(Ordering::SeqCst), 2);

    for _ in 0..100 {
        if system.dispatcher_stats().processed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = system.dispatcher_stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.processed, 1);
    system.shutdown().await.unwrap();
}

/// Basket update, checkout and the message left on the checkout queue.
#[tokio::test]
async fn test_basket_checkout_publishes_and_clears_basket() {
    let (system, broker, _email, _rx) = start(0).await;
    let app = system.router();

    let basket = json!({
        "buyerId": "ada",
        "items": [{ "productId": "p-1", "productName": "Widget", "unitPrice": 2.5, "quantity": 4 }]
    });
    let (status, stored) = send(&app, post("/basket").body(json_body(basket)).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["items"].as_array().map(Vec::len), Some(1));

    let checkout = json!({ "buyer": "ada", "cardHolderName": "Ada Lovelace", "city": "London" });
    let (status, accepted) = send(
        &app,
        post("/basket/checkout")
            .header("x-buyer-id", "ada")
            .body(json_body(checkout))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(accepted["requestId"].as_str().is_some());
    assert_eq!(broker.ready_count("basket-checkout-queue"), 1);

    let (status, basket) = send(
        &app,
        Request::builder().uri("/basket/ada").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(basket, json!({ "buyerId": "ada", "items": [] }));

    system.shutdown().await.unwrap();
}

/// Nothing drains the checkout queue in-process, so it stops taking messages once full.
#[tokio::test]
async fn test_checkout_fails_and_keeps_basket_when_queue_full() {
    let broker = QueueBroker::with_limits(broker_framework::queue_broker::DEFAULT_MAX_DELIVERIES, 1);
    let (system, broker, _email, _rx) = start_with(broker, 0).await;
    let app = system.router();

    for buyer in ["ada", "grace"] {
        let basket = json!({
            "buyerId": buyer,
            "items": [{ "productId": "p-1", "productName": "Widget", "unitPrice": 1.0, "quantity": 1 }]
        });
        let (status, _) = send(&app, post("/basket").body(json_body(basket)).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
    }

    let checkout = |buyer: &str| {
        post("/basket/checkout")
            .header("x-buyer-id", buyer)
            .body(json_body(json!({ "buyer": buyer })))
            .unwrap()
    };
    let (status, _) = send(&app, checkout("ada")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = send(&app, checkout("grace")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(broker.ready_count("basket-checkout-queue"), 1);

    let (_, basket) = send(
        &app,
        Request::builder().uri("/basket/grace").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(basket["items"].as_array().map(Vec::len), Some(1));

    system.shutdown().await.unwrap();
}
