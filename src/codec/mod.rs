//! Provider codecs: turn an opaque inbound payload into a [`ProviderEvent`].
//!
//! Each gateway has its own wire format and authentication scheme. The
//! codecs are pure: they decode, verify and normalize, and only log for
//! diagnostics. Selection happens by explicit provider identity (the
//! webhook route or the poller's provider), never by sniffing the payload.

pub mod gateway_a;
pub mod gateway_b;
pub mod gateway_c;

use bigdecimal::BigDecimal;
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

use crate::domain::{CanonicalStatus, Provider, ProviderEvent};

pub use gateway_a::EncryptedCodec;
pub use gateway_b::SignedCodec;
pub use gateway_c::PlainCodec;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Missing signature header")]
    MissingSignature,

    #[error("Signature mismatch")]
    InvalidSignature,

    #[error("Ciphertext could not be decrypted after {attempts} cipher attempts")]
    Undecryptable { attempts: usize },

    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Missing mandatory field: {0}")]
    MissingField(&'static str),
}

impl CodecError {
    /// Errors that cast doubt on who sent the payload. These are rejected;
    /// everything else is acknowledged so the gateway stops retrying.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            CodecError::MissingSignature
                | CodecError::InvalidSignature
                | CodecError::Undecryptable { .. }
        )
    }
}

/// Raw webhook delivery as received on the wire.
#[derive(Debug, Clone, Copy)]
pub struct RawWebhook<'a> {
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
}

/// Explicit provider status-code table. Codes are matched after trimming
/// and upper-casing; anything not listed maps to `pending` and is logged.
#[derive(Debug)]
pub struct StatusTable {
    pub provider: Provider,
    pub completed: &'static [&'static str],
    pub failed: &'static [&'static str],
    pub pending: &'static [&'static str],
}

impl StatusTable {
    pub fn map(&self, raw_code: &str, order_id: &str) -> CanonicalStatus {
        let code = raw_code.trim().to_ascii_uppercase();
        if self.completed.contains(&code.as_str()) {
            CanonicalStatus::Completed
        } else if self.failed.contains(&code.as_str()) {
            CanonicalStatus::Failed
        } else {
            if !self.pending.contains(&code.as_str()) {
                tracing::warn!(
                    provider = %self.provider,
                    order_id = %order_id,
                    raw_status_code = %raw_code,
                    "Unmapped provider status code, treating as pending"
                );
            }
            CanonicalStatus::Pending
        }
    }
}

/// One codec per provider.
#[derive(Debug, Clone)]
pub enum ProviderCodec {
    GatewayA(EncryptedCodec),
    GatewayB(SignedCodec),
    GatewayC(PlainCodec),
}

impl ProviderCodec {
    pub fn provider(&self) -> Provider {
        match self {
            ProviderCodec::GatewayA(_) => Provider::GatewayA,
            ProviderCodec::GatewayB(_) => Provider::GatewayB,
            ProviderCodec::GatewayC(_) => Provider::GatewayC,
        }
    }

    /// Name of the header carrying the webhook signature, if the provider signs.
    pub fn signature_header(&self) -> Option<&'static str> {
        match self {
            ProviderCodec::GatewayB(_) => Some(gateway_b::SIGNATURE_HEADER),
            _ => None,
        }
    }

    /// Decodes an inbound webhook. The returned event is tagged `source: webhook`.
    pub fn decode_webhook(&self, raw: &RawWebhook<'_>) -> Result<ProviderEvent, CodecError> {
        match self {
            ProviderCodec::GatewayA(codec) => codec.decode(raw.body),
            ProviderCodec::GatewayB(codec) => codec.decode_verified(raw.body, raw.signature),
            ProviderCodec::GatewayC(codec) => codec.decode(raw.body),
        }
    }

    /// Decodes the body of a status-query response. No signature is expected
    /// since the answer comes back on our own authenticated request.
    pub fn decode_status_response(&self, body: &[u8]) -> Result<ProviderEvent, CodecError> {
        match self {
            ProviderCodec::GatewayA(codec) => codec.decode(body),
            ProviderCodec::GatewayB(codec) => codec.decode_unsigned(body),
            ProviderCodec::GatewayC(codec) => codec.decode(body),
        }
    }
}

fn parse_json(bytes: &[u8]) -> Result<Value, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedPayload(e.to_string()))
}

/// Reads a string field, accepting numbers too, ignoring empty values.
fn string_field(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match payload.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn required_field(payload: &Value, keys: &[&str], name: &'static str) -> Result<String, CodecError> {
    string_field(payload, keys).ok_or(CodecError::MissingField(name))
}

/// Amounts are a soft check, so an unparsable amount is dropped rather than
/// failing the whole event.
fn amount_field(payload: &Value, keys: &[&str]) -> Option<BigDecimal> {
    let raw = string_field(payload, keys)?;
    match BigDecimal::from_str(&raw) {
        Ok(amount) => Some(amount),
        Err(_) => {
            tracing::warn!(amount = %raw, "Ignoring unparsable amount in provider payload");
            None
        }
    }
}
