//! Order ingress types and the command that travels over the broker.
//!
//! [`OrderRequest`] is what the HTTP surface accepts; [`OrderCommand`] is what the
//! publisher puts on the order queue. A request that fails [`OrderRequest::validate`]
//! never becomes a command.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use uuid::Uuid;

/// Type-safe identifier for Orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTP input for `POST /order`. Missing fields deserialize to their zero value and are
/// then rejected by validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderRequest {
    pub order_amount: f64,
    pub order_number: String,
}

impl OrderRequest {
    pub fn validate(&self) -> Result<(), String> {
        if !self.order_amount.is_finite() || self.order_amount <= 0.0 {
            return Err(format!(
                "orderAmount must be a positive number, got {}",
                self.order_amount
            ));
        }
        if self.order_number.trim().is_empty() {
            return Err("orderNumber must not be empty".to_string());
        }
        Ok(())
    }
}

/// The command published to the order queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCommand {
    pub order_id: OrderId,
    pub order_amount: f64,
    pub order_number: String,
    pub order_date: DateTime<Utc>,
    pub correlation_id: String,
}

impl OrderCommand {
    pub const MESSAGE_TYPE: &'static str = "order.command";

    /// Builds a command from an already validated request.
    pub fn from_request(request: OrderRequest, correlation_id: impl Into<String>) -> Self {
        Self {
            order_id: OrderId::new(),
            order_amount: request.order_amount,
            order_number: request.order_number.trim().to_string(),
            order_date: Utc::now(),
            correlation_id: correlation_id.into(),
        }
    }
}

/// A message handed to the email service once an order is consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub notification_id: Uuid,
    pub notification_type: String,
    pub content: String,
    pub address: String,
    pub date: DateTime<Utc>,
}

impl Notification {
    pub fn order_confirmation(order: &OrderCommand, address: impl Into<String>) -> Self {
        Self {
            notification_id: Uuid::new_v4(),
            notification_type: "order-confirmation".to_string(),
            content: format!("Order: {}", order.order_number),
            address: address.into(),
            date: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(amount: f64, number: &str) -> OrderRequest {
        OrderRequest {
            order_amount: amount,
            order_number: number.to_string(),
        }
    }

    #[test]
    fn test_validation() {
        assert!(request(10.5, "N-1").validate().is_ok());
        assert!(request(0.0, "N-1").validate().is_err());
        assert!(request(-3.0, "N-1").validate().is_err());
        assert!(request(f64::NAN, "N-1").validate().is_err());
        assert!(request(f64::INFINITY, "N-1").validate().is_err());
        assert!(request(1.0, "   ").validate().is_err());
    }

    #[test]
    fn test_missing_fields_deserialize_and_fail_validation() {
        let request: OrderRequest = serde_json::from_str(r#"{"orderNumber":"N-1"}"#).unwrap();
        assert_eq!(request.order_amount, 0.0);
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_command_wire_format() {
        let command = OrderCommand::from_request(request(12.0, " N-7 "), "corr-1");
        let json = serde_json::to_value(&command).unwrap();

        assert_eq!(json["orderNumber"], "N-7");
        assert_eq!(json["orderAmount"], 12.0);
        assert_eq!(json["correlationId"], "corr-1");
        assert_eq!(json["orderId"], command.order_id.to_string());
        assert!(json["orderDate"].as_str().unwrap().contains('T'));
    }
}
