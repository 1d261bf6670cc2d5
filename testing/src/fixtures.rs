//! Inbound event and exception fixtures.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use crate::test_clock;
use exception_collector_core::environment::Clock;
use exception_collector_core::exception::InterfaceException;
use exception_collector_core::inbound::{InboundEvent, normalize};
use exception_collector_core::lifecycle::ingest;
use exception_collector_core::message::InboundMessage;
use serde_json::{Value, json};

/// Inbound topic used by the fixtures.
pub const ORDER_TOPIC: &str = "OrderRejected";

/// Envelope around an arbitrary payload.
#[must_use]
pub fn envelope(event_type: &str, payload: Option<Value>) -> InboundEvent {
    InboundEvent {
        event_id: Some(format!("evt-{event_type}")),
        event_type: event_type.to_string(),
        event_version: "1.0".to_string(),
        occurred_on: Some(test_clock().now()),
        source: Some("partner-order-service".to_string()),
        correlation_id: Some("corr-1".to_string()),
        causation_id: None,
        payload,
    }
}

/// `OrderRejected` with a retryable reason.
#[must_use]
pub fn order_rejected(transaction_id: &str) -> InboundEvent {
    order_rejected_because(transaction_id, "Service unavailable")
}

/// `OrderRejected` with a chosen reason.
#[must_use]
pub fn order_rejected_because(transaction_id: &str, reason: &str) -> InboundEvent {
    envelope(
        "OrderRejected",
        Some(json!({
            "transactionId": transaction_id,
            "externalId": format!("ORD-{transaction_id}"),
            "operation": "CREATE_ORDER",
            "rejectedReason": reason,
            "customerId": "CUST-001",
            "locationCode": "LOC-001",
        })),
    )
}

/// Serialized envelope bytes.
#[must_use]
pub fn to_bytes(event: &InboundEvent) -> Vec<u8> {
    serde_json::to_vec(event).unwrap()
}

/// Broker message carrying `event`.
#[must_use]
pub fn message(partition: i32, offset: i64, event: &InboundEvent) -> InboundMessage {
    InboundMessage::new(ORDER_TOPIC, partition, offset, Some(to_bytes(event)))
}

/// A freshly ingested, retryable `NEW` exception.
#[must_use]
pub fn exception(transaction_id: &str) -> InterfaceException {
    ingest(normalize(&order_rejected(transaction_id), test_clock().now()).unwrap())
}

/// A freshly ingested exception that cannot be retried.
#[must_use]
pub fn non_retryable_exception(transaction_id: &str) -> InterfaceException {
    ingest(
        normalize(
            &order_rejected_because(transaction_id, "Order already exists"),
            test_clock().now(),
        )
        .unwrap(),
    )
}
