//! Inbound failure events and their normalization.
//!
//! Each upstream interface publishes its own payload shape inside a shared
//! JSON envelope. [`normalize`] turns any of them into one
//! [`InterfaceException`] candidate; it never touches storage.

use crate::classify::classify;
use crate::exception::{ExceptionStatus, InterfaceException, InterfaceType};
use crate::ids::{TransactionId, Version};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Terminal problems with an inbound event.
///
/// A malformed event can never be processed, no matter how often it is
/// redelivered. The consumer acknowledges and drops it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedEventError {
    /// The message body is not a JSON envelope.
    #[error("Event is not a valid envelope: {0}")]
    InvalidEnvelope(String),

    /// `eventType` names no known failure shape.
    #[error("Unknown event type: {0:?}")]
    UnknownEventType(String),

    /// The envelope carries no payload.
    #[error("{event_type} event has no payload")]
    MissingPayload {
        /// Declared event type.
        event_type: String,
    },

    /// `payload.transactionId` is absent or blank.
    #[error("{event_type} payload has no transactionId")]
    MissingTransactionId {
        /// Declared event type.
        event_type: String,
    },

    /// The payload does not decode into its declared shape.
    #[error("{event_type} payload is invalid: {reason}")]
    InvalidPayload {
        /// Declared event type.
        event_type: String,
        /// Decoder message.
        reason: String,
    },
}

/// Shared envelope of every inbound failure event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// Producer-assigned event id.
    #[serde(default)]
    pub event_id: Option<String>,
    /// One of the [`FailureKind`] names.
    #[serde(default)]
    pub event_type: String,
    /// Schema version of the payload.
    #[serde(default = "default_event_version")]
    pub event_version: String,
    /// When the failure happened upstream.
    #[serde(default)]
    pub occurred_on: Option<DateTime<Utc>>,
    /// Producing service.
    #[serde(default)]
    pub source: Option<String>,
    /// End-to-end correlation id.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Id of the event that caused this one.
    #[serde(default)]
    pub causation_id: Option<String>,
    /// Interface-specific body; always carries `transactionId`.
    #[serde(default)]
    pub payload: Option<Value>,
}

fn default_event_version() -> String {
    "1.0".to_string()
}

impl InboundEvent {
    /// Decode an envelope from raw message bytes.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedEventError::InvalidEnvelope`] when the bytes are
    /// not a JSON object of the envelope shape.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MalformedEventError> {
        serde_json::from_slice(bytes)
            .map_err(|e| MalformedEventError::InvalidEnvelope(e.to_string()))
    }

    /// The payload's `transactionId`, if present and not blank.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("transactionId"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }
}

/// The inbound failure shapes the collector understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// An order was rejected by the order service.
    OrderRejected,
    /// An order was cancelled upstream.
    OrderCancelled,
    /// A collection was rejected.
    CollectionRejected,
    /// A distribution could not be completed.
    DistributionFailed,
    /// A message failed schema validation in some interface.
    ValidationError,
}

impl FailureKind {
    /// Every kind.
    pub const ALL: [Self; 5] = [
        Self::OrderRejected,
        Self::OrderCancelled,
        Self::CollectionRejected,
        Self::DistributionFailed,
        Self::ValidationError,
    ];

    /// Resolve an envelope `eventType`.
    #[must_use]
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.event_type() == event_type)
    }

    /// The `eventType` string on the wire.
    #[must_use]
    pub const fn event_type(self) -> &'static str {
        match self {
            Self::OrderRejected => "OrderRejected",
            Self::OrderCancelled => "OrderCancelled",
            Self::CollectionRejected => "CollectionRejected",
            Self::DistributionFailed => "DistributionFailed",
            Self::ValidationError => "ValidationError",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRejectedPayload {
    #[serde(default, deserialize_with = "lenient_text")]
    external_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    operation: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    rejected_reason: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    customer_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    location_code: Option<String>,
    #[serde(default)]
    order_items: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCancelledPayload {
    #[serde(default, deserialize_with = "lenient_text")]
    external_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    cancel_reason: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    customer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionRejectedPayload {
    #[serde(default, deserialize_with = "lenient_text")]
    collection_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    operation: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    rejected_reason: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    donor_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    location_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DistributionFailedPayload {
    #[serde(default, deserialize_with = "lenient_text")]
    distribution_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    operation: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    failure_reason: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    customer_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    destination_location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidationErrorPayload {
    #[serde(default, deserialize_with = "lenient_text")]
    external_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    interface_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_field_errors")]
    validation_errors: Vec<FieldError>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldError {
    field: String,
    message: String,
    #[serde(default)]
    rejected_value: Option<Value>,
}

/// Optional text field that tolerates any JSON type.
///
/// Strings and numbers are kept; blanks and anything else read as absent.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let text = match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    Ok(text.filter(|s| !s.trim().is_empty()))
}

/// Field errors, skipping entries that do not have the expected shape.
fn lenient_field_errors<'de, D>(deserializer: D) -> Result<Vec<FieldError>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let Value::Array(entries) = Value::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    Ok(entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value(entry).ok())
        .collect())
}

/// Interface-specific fields after decoding a payload.
struct Fields {
    interface_type: InterfaceType,
    external_id: Option<String>,
    operation: String,
    reason: String,
    customer_id: Option<String>,
    location_code: Option<String>,
    enrichment: Option<Value>,
}

/// Normalize an inbound event into an exception candidate.
///
/// The candidate is `NEW` at [`Version::INITIAL`] with no retries. Category,
/// severity and retryability come from [`classify`]. When the envelope has
/// no `occurredOn` the ingestion time stands in for it.
///
/// # Errors
///
/// Returns [`MalformedEventError`] when the event type is unknown, the
/// payload is absent, or `transactionId` is absent or blank. Missing or
/// mistyped interface fields never fail normalization: reasons fall back to
/// a generic text per failure kind.
pub fn normalize(
    event: &InboundEvent,
    processed_at: DateTime<Utc>,
) -> Result<InterfaceException, MalformedEventError> {
    let kind = FailureKind::from_event_type(&event.event_type)
        .ok_or_else(|| MalformedEventError::UnknownEventType(event.event_type.clone()))?;
    let payload = event
        .payload
        .as_ref()
        .filter(|p| !p.is_null())
        .ok_or_else(|| MalformedEventError::MissingPayload {
            event_type: event.event_type.clone(),
        })?;
    let transaction_id =
        event
            .transaction_id()
            .ok_or_else(|| MalformedEventError::MissingTransactionId {
                event_type: event.event_type.clone(),
            })?;

    let fields = decode_fields(kind, payload)?;
    let classification = classify(fields.interface_type, &fields.reason);

    Ok(InterfaceException {
        transaction_id,
        interface_type: fields.interface_type,
        external_id: fields.external_id,
        operation: fields.operation,
        exception_reason: fields.reason,
        category: classification.category,
        severity: classification.severity,
        status: ExceptionStatus::New,
        customer_id: fields.customer_id,
        location_code: fields.location_code,
        retryable: classification.retryable,
        retry_count: 0,
        acknowledged_by: None,
        acknowledged_at: None,
        acknowledgment_notes: None,
        resolved_by: None,
        resolved_at: None,
        resolution_method: None,
        resolution_notes: None,
        last_retry_at: None,
        timestamp: event.occurred_on.unwrap_or(processed_at),
        processed_at,
        correlation_id: event.correlation_id.clone(),
        enrichment: fields.enrichment,
        version: Version::INITIAL,
    })
}

fn decode<T: DeserializeOwned>(kind: FailureKind, payload: &Value) -> Result<T, MalformedEventError> {
    T::deserialize(payload).map_err(|e| MalformedEventError::InvalidPayload {
        event_type: kind.event_type().to_string(),
        reason: e.to_string(),
    })
}

fn decode_fields(kind: FailureKind, payload: &Value) -> Result<Fields, MalformedEventError> {
    let fields = match kind {
        FailureKind::OrderRejected => {
            let p: OrderRejectedPayload = decode(kind, payload)?;
            Fields {
                interface_type: InterfaceType::Order,
                external_id: p.external_id,
                operation: p.operation.unwrap_or_else(|| "CREATE_ORDER".to_string()),
                reason: p
                    .rejected_reason
                    .unwrap_or_else(|| "Order rejected".to_string()),
                customer_id: p.customer_id,
                location_code: p.location_code,
                enrichment: p
                    .order_items
                    .map(|items| serde_json::json!({ "orderItems": items })),
            }
        }
        FailureKind::OrderCancelled => {
            let p: OrderCancelledPayload = decode(kind, payload)?;
            Fields {
                interface_type: InterfaceType::Order,
                external_id: p.external_id,
                operation: "CANCEL_ORDER".to_string(),
                reason: p
                    .cancel_reason
                    .unwrap_or_else(|| "Order cancelled".to_string()),
                customer_id: p.customer_id,
                location_code: None,
                enrichment: None,
            }
        }
        FailureKind::CollectionRejected => {
            let p: CollectionRejectedPayload = decode(kind, payload)?;
            Fields {
                interface_type: InterfaceType::Collection,
                external_id: p.collection_id,
                operation: p.operation.unwrap_or_else(|| "CREATE_COLLECTION".to_string()),
                reason: p
                    .rejected_reason
                    .unwrap_or_else(|| "Collection rejected".to_string()),
                customer_id: p.donor_id,
                location_code: p.location_code,
                enrichment: None,
            }
        }
        FailureKind::DistributionFailed => {
            let p: DistributionFailedPayload = decode(kind, payload)?;
            Fields {
                interface_type: InterfaceType::Distribution,
                external_id: p.distribution_id,
                operation: p
                    .operation
                    .unwrap_or_else(|| "CREATE_DISTRIBUTION".to_string()),
                reason: p
                    .failure_reason
                    .unwrap_or_else(|| "Distribution failed".to_string()),
                customer_id: p.customer_id,
                location_code: p.destination_location,
                enrichment: None,
            }
        }
        FailureKind::ValidationError => {
            let p: ValidationErrorPayload = decode(kind, payload)?;
            // The source interface is recorded in the enrichment snapshot;
            // the exception itself is filed under VALIDATION. An unknown
            // label is kept as sent.
            let source_interface = p.interface_type.map(|label| {
                label
                    .parse::<InterfaceType>()
                    .map_or(label, |known| known.as_str().to_string())
            });
            Fields {
                interface_type: InterfaceType::Validation,
                external_id: p.external_id,
                operation: "VALIDATION".to_string(),
                reason: aggregate_validation_errors(&p.validation_errors),
                customer_id: None,
                location_code: None,
                enrichment: Some(serde_json::json!({
                    "sourceInterface": source_interface,
                    "validationErrors": p.validation_errors,
                })),
            }
        }
    };
    Ok(fields)
}

fn aggregate_validation_errors(errors: &[FieldError]) -> String {
    if errors.is_empty() {
        return "Validation failed".to_string();
    }
    errors
        .iter()
        .map(|e| format!("Field '{}': {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::exception::{ExceptionCategory, ExceptionSeverity};
    use serde_json::json;

    fn envelope(event_type: &str, payload: Option<Value>) -> InboundEvent {
        InboundEvent {
            event_id: Some("evt-1".into()),
            event_type: event_type.into(),
            event_version: "1.0".into(),
            occurred_on: None,
            source: Some("partner-order-service".into()),
            correlation_id: Some("corr-1".into()),
            causation_id: None,
            payload,
        }
    }

    fn now() -> DateTime<Utc> {
        "2025-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn order_rejected_maps_all_fields() {
        let event = envelope(
            "OrderRejected",
            Some(json!({
                "transactionId": "T1",
                "externalId": "ORD-7",
                "operation": "CREATE_ORDER",
                "rejectedReason": "Order already exists",
                "customerId": "CUST-1",
                "locationCode": "LOC-1",
                "orderItems": [{"bloodType": "O-", "quantity": 2}]
            })),
        );

        let exception = normalize(&event, now()).unwrap();

        assert_eq!(exception.transaction_id.as_str(), "T1");
        assert_eq!(exception.interface_type, InterfaceType::Order);
        assert_eq!(exception.external_id.as_deref(), Some("ORD-7"));
        assert_eq!(exception.status, ExceptionStatus::New);
        assert_eq!(exception.retry_count, 0);
        assert_eq!(exception.version, Version::INITIAL);
        assert_eq!(exception.category, ExceptionCategory::BusinessRule);
        assert!(!exception.retryable);
        assert_eq!(exception.timestamp, now());
        assert_eq!(exception.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(
            exception.enrichment.unwrap()["orderItems"][0]["quantity"],
            json!(2)
        );
    }

    #[test]
    fn order_cancelled_uses_fixed_operation() {
        let event = envelope(
            "OrderCancelled",
            Some(json!({"transactionId": "T2", "cancelReason": "Customer request"})),
        );
        let exception = normalize(&event, now()).unwrap();
        assert_eq!(exception.operation, "CANCEL_ORDER");
        assert_eq!(exception.exception_reason, "Customer request");
    }

    #[test]
    fn collection_and_distribution_remap_ids() {
        let collection = normalize(
            &envelope(
                "CollectionRejected",
                Some(json!({
                    "transactionId": "T3",
                    "collectionId": "COL-1",
                    "donorId": "DON-9",
                    "rejectedReason": "Donor deferred",
                })),
            ),
            now(),
        )
        .unwrap();
        assert_eq!(collection.external_id.as_deref(), Some("COL-1"));
        assert_eq!(collection.customer_id.as_deref(), Some("DON-9"));
        assert_eq!(collection.severity, ExceptionSeverity::High);

        let distribution = normalize(
            &envelope(
                "DistributionFailed",
                Some(json!({
                    "transactionId": "T4",
                    "distributionId": "DIS-1",
                    "failureReason": "Connection failed",
                    "destinationLocation": "HOSP-2",
                })),
            ),
            now(),
        )
        .unwrap();
        assert_eq!(distribution.external_id.as_deref(), Some("DIS-1"));
        assert_eq!(distribution.location_code.as_deref(), Some("HOSP-2"));
        assert_eq!(distribution.category, ExceptionCategory::NetworkError);
    }

    #[test]
    fn validation_errors_are_aggregated() {
        let event = envelope(
            "ValidationError",
            Some(json!({
                "transactionId": "T5",
                "interfaceType": "ORDER",
                "validationErrors": [
                    {"field": "quantity", "message": "must be positive", "rejectedValue": -1},
                    {"field": "bloodType", "message": "is required"}
                ]
            })),
        );
        let exception = normalize(&event, now()).unwrap();
        assert_eq!(exception.interface_type, InterfaceType::Validation);
        assert_eq!(
            exception.exception_reason,
            "Field 'quantity': must be positive; Field 'bloodType': is required"
        );
        assert_eq!(exception.severity, ExceptionSeverity::Medium);
        assert!(exception.retryable);
    }

    #[test]
    fn missing_payload_is_malformed() {
        let err = normalize(&envelope("OrderRejected", None), now()).unwrap_err();
        assert!(matches!(err, MalformedEventError::MissingPayload { .. }));

        let err = normalize(&envelope("OrderRejected", Some(Value::Null)), now()).unwrap_err();
        assert!(matches!(err, MalformedEventError::MissingPayload { .. }));
    }

    #[test]
    fn blank_transaction_id_is_malformed() {
        for payload in [
            json!({"rejectedReason": "x"}),
            json!({"transactionId": "   ", "rejectedReason": "x"}),
            json!({"transactionId": 42, "rejectedReason": "x"}),
        ] {
            let err = normalize(&envelope("OrderRejected", Some(payload)), now()).unwrap_err();
            assert!(matches!(err, MalformedEventError::MissingTransactionId { .. }));
        }
    }

    #[test]
    fn unknown_event_type_is_malformed() {
        let err = normalize(
            &envelope("OrderShipped", Some(json!({"transactionId": "T"}))),
            now(),
        )
        .unwrap_err();
        assert_eq!(err, MalformedEventError::UnknownEventType("OrderShipped".into()));
    }

    #[test]
    fn bare_transaction_id_is_captured_for_every_kind() {
        for kind in FailureKind::ALL {
            let exception = normalize(
                &envelope(kind.event_type(), Some(json!({"transactionId": "T1"}))),
                now(),
            )
            .unwrap();
            assert_eq!(exception.transaction_id.as_str(), "T1");
            assert_eq!(exception.status, ExceptionStatus::New);
            assert!(!exception.exception_reason.is_empty());
        }

        let order = normalize(
            &envelope("OrderRejected", Some(json!({"transactionId": "T1"}))),
            now(),
        )
        .unwrap();
        assert_eq!(order.exception_reason, "Order rejected");
        assert_eq!(order.operation, "CREATE_ORDER");
        assert!(order.retryable);
    }

    #[test]
    fn mistyped_fields_are_tolerated() {
        let exception = normalize(
            &envelope(
                "DistributionFailed",
                Some(json!({
                    "transactionId": "T6",
                    "distributionId": 1234,
                    "failureReason": {"code": 7},
                    "customerId": "   ",
                })),
            ),
            now(),
        )
        .unwrap();
        assert_eq!(exception.external_id.as_deref(), Some("1234"));
        assert_eq!(exception.exception_reason, "Distribution failed");
        assert_eq!(exception.customer_id, None);
    }

    #[test]
    fn validation_error_keeps_unknown_source_interface() {
        let unknown = normalize(
            &envelope(
                "ValidationError",
                Some(json!({
                    "transactionId": "T7",
                    "interfaceType": "BILLING",
                    "validationErrors": [{"field": "amount"}, {"field": "x", "message": "bad"}]
                })),
            ),
            now(),
        )
        .unwrap();
        assert_eq!(unknown.interface_type, InterfaceType::Validation);
        assert_eq!(unknown.exception_reason, "Field 'x': bad");
        assert_eq!(unknown.enrichment.unwrap()["sourceInterface"], json!("BILLING"));

        let missing = normalize(
            &envelope("ValidationError", Some(json!({"transactionId": "T8"}))),
            now(),
        )
        .unwrap();
        assert_eq!(missing.exception_reason, "Validation failed");
        assert_eq!(missing.enrichment.unwrap()["sourceInterface"], Value::Null);
    }

    #[test]
    fn envelope_decoding() {
        let event = InboundEvent::from_slice(
            br#"{"eventType":"OrderRejected","occurredOn":"2024-12-31T23:00:00Z",
                 "payload":{"transactionId":"T9","rejectedReason":"timeout"}}"#,
        )
        .unwrap();
        assert_eq!(event.event_version, "1.0");
        let exception = normalize(&event, now()).unwrap();
        assert_eq!(exception.timestamp.to_rfc3339(), "2024-12-31T23:00:00+00:00");

        assert!(matches!(
            InboundEvent::from_slice(b"not json"),
            Err(MalformedEventError::InvalidEnvelope(_))
        ));
    }
}
