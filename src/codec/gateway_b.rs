//! Gateway-B: plaintext JSON webhooks authenticated with an HMAC-SHA256
//! signature over the exact raw request body.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::fmt;

use super::{amount_field, parse_json, required_field, string_field, CodecError, StatusTable};
use crate::domain::{EventSource, Provider, ProviderEvent};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

pub const STATUS_TABLE: StatusTable = StatusTable {
    provider: Provider::GatewayB,
    completed: &["SUCCESS", "CAPTURED", "PAID"],
    failed: &["FAILED", "CANCELLED", "EXPIRED", "DECLINED"],
    pending: &["PENDING", "CREATED", "PROCESSING"],
};

#[derive(Clone)]
pub struct SignedCodec {
    webhook_secret: String,
}

impl fmt::Debug for SignedCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedCodec").field("webhook_secret", &"****").finish()
    }
}

impl SignedCodec {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Hex-encoded HMAC-SHA256 of `body`, as the gateway computes it.
    pub fn signature_for(&self, body: &[u8]) -> Result<String, CodecError> {
        Ok(hex::encode(self.mac_for(body)?.finalize().into_bytes()))
    }

    pub fn decode_verified(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<ProviderEvent, CodecError> {
        let signature = signature.ok_or(CodecError::MissingSignature)?;
        self.verify(body, signature)?;
        self.decode_unsigned(body)
    }

    pub fn decode_unsigned(&self, body: &[u8]) -> Result<ProviderEvent, CodecError> {
        to_event(parse_json(body)?)
    }

    fn verify(&self, body: &[u8], signature: &str) -> Result<(), CodecError> {
        let provided = hex::decode(signature.trim()).map_err(|_| {
            tracing::warn!(provider = %Provider::GatewayB, "Signature header is not hex");
            CodecError::InvalidSignature
        })?;

        self.mac_for(body)?.verify_slice(&provided).map_err(|_| {
            tracing::warn!(
                provider = %Provider::GatewayB,
                body_len = body.len(),
                "Webhook signature mismatch"
            );
            CodecError::InvalidSignature
        })
    }

    fn mac_for(&self, body: &[u8]) -> Result<HmacSha256, CodecError> {
        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes()).map_err(|_| {
            tracing::error!(provider = %Provider::GatewayB, "Webhook secret rejected as HMAC key");
            CodecError::InvalidSignature
        })?;
        mac.update(body);
        Ok(mac)
    }
}

fn to_event(payload: Value) -> Result<ProviderEvent, CodecError> {
    let order_id = required_field(&payload, &["order_id"], "order_id")?;
    let raw_status_code = string_field(&payload, &["status"]).unwrap_or_default();
    let canonical_status = STATUS_TABLE.map(&raw_status_code, &order_id);

    Ok(ProviderEvent {
        provider: Provider::GatewayB,
        provider_payment_id: string_field(&payload, &["payment_id"]),
        settlement_reference: string_field(&payload, &["utr", "rrn"]),
        amount: amount_field(&payload, &["amount"]),
        message: string_field(&payload, &["message", "failure_reason"]),
        order_id,
        raw_status_code,
        canonical_status,
        source: EventSource::Webhook,
        raw_payload: payload,
    })
}
