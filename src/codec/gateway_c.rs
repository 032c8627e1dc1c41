//! Gateway-C: unauthenticated plain JSON.

use super::{amount_field, parse_json, required_field, string_field, CodecError, StatusTable};
use crate::domain::{EventSource, Provider, ProviderEvent};

pub const STATUS_TABLE: StatusTable = StatusTable {
    provider: Provider::GatewayC,
    completed: &["COMPLETED", "SUCCESS"],
    failed: &["FAILED", "REJECTED"],
    pending: &["PENDING", "INITIATED"],
};

#[derive(Debug, Clone, Default)]
pub struct PlainCodec;

impl PlainCodec {
    pub fn decode(&self, body: &[u8]) -> Result<ProviderEvent, CodecError> {
        let payload = parse_json(body)?;
        let order_id = required_field(&payload, &["orderId"], "orderId")?;
        let raw_status_code = string_field(&payload, &["status"]).unwrap_or_default();
        let canonical_status = STATUS_TABLE.map(&raw_status_code, &order_id);

        Ok(ProviderEvent {
            provider: Provider::GatewayC,
            provider_payment_id: string_field(&payload, &["transactionId"]),
            settlement_reference: string_field(&payload, &["utr"]),
            amount: amount_field(&payload, &["amount"]),
            message: string_field(&payload, &["message"]),
            order_id,
            raw_status_code,
            canonical_status,
            source: EventSource::Webhook,
            raw_payload: payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CanonicalStatus;
    use serde_json::json;

    #[test]
    fn test_decode_completed() {
        let body = json!({
            "orderId": "ORD_C1",
            "transactionId": "c-42",
            "status": "COMPLETED",
            "utr": "UTR900",
            "amount": "75.5"
        })
        .to_string();

        let event = PlainCodec.decode(body.as_bytes()).unwrap();
        assert_eq!(event.provider, Provider::GatewayC);
        assert_eq!(event.canonical_status, CanonicalStatus::Completed);
        assert_eq!(event.provider_payment_id.as_deref(), Some("c-42"));
        assert_eq!(event.settlement_reference.as_deref(), Some("UTR900"));
    }

    #[test]
    fn test_missing_status_is_pending() {
        let body = json!({"orderId": "ORD_C2"}).to_string();
        let event = PlainCodec.decode(body.as_bytes()).unwrap();
        assert_eq!(event.canonical_status, CanonicalStatus::Pending);
    }

    #[test]
    fn test_rejects_non_json_and_missing_order() {
        assert!(matches!(
            PlainCodec.decode(b"<xml/>"),
            Err(CodecError::MalformedPayload(_))
        ));
        let body = json!({"status": "FAILED"}).to_string();
        assert_eq!(
            PlainCodec.decode(body.as_bytes()),
            Err(CodecError::MissingField("orderId"))
        );
    }
}
