//! Canonical event shape every provider codec decodes into.

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::transaction::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalStatus {
    Completed,
    Failed,
    Pending,
}

impl CanonicalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Completed => "completed",
            CanonicalStatus::Failed => "failed",
            CanonicalStatus::Pending => "pending",
        }
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Webhook,
    Poll,
    Manual,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventSource::Webhook => "webhook",
            EventSource::Poll => "poll",
            EventSource::Manual => "manual",
        })
    }
}

/// Transient, decoded view of a provider notification or status answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub provider: Provider,
    pub order_id: String,
    pub provider_payment_id: Option<String>,
    pub settlement_reference: Option<String>,
    pub raw_status_code: String,
    pub canonical_status: CanonicalStatus,
    pub amount: Option<BigDecimal>,
    pub message: Option<String>,
    pub source: EventSource,
    pub raw_payload: serde_json::Value,
}

impl ProviderEvent {
    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }
}
