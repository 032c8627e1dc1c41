//! Transaction domain entity.
//! Framework-agnostic representation of a payment order under reconciliation.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::event::{CanonicalStatus, EventSource};

/// External payment gateway a transaction was created against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    /// Encrypted-webhook gateway.
    GatewayA,
    /// Signed-plaintext gateway.
    GatewayB,
    /// Plain-JSON gateway.
    GatewayC,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::GatewayA, Provider::GatewayB, Provider::GatewayC];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GatewayA => "gateway-a",
            Provider::GatewayB => "gateway-b",
            Provider::GatewayC => "gateway-c",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gateway-a" => Ok(Provider::GatewayA),
            "gateway-b" => Ok(Provider::GatewayB),
            "gateway-c" => Ok(Provider::GatewayC),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Refunded => "refunded",
        }
    }

    /// `pending` is the only non-terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "failed" => Ok(TransactionStatus::Failed),
            "refunded" => Ok(TransactionStatus::Refunded),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

impl From<CanonicalStatus> for TransactionStatus {
    fn from(status: CanonicalStatus) -> Self {
        match status {
            CanonicalStatus::Completed => TransactionStatus::Completed,
            CanonicalStatus::Failed => TransactionStatus::Failed,
            CanonicalStatus::Pending => TransactionStatus::Pending,
        }
    }
}

/// One applied event, kept for forensic replay. Never used to derive status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub source: EventSource,
    pub provider: Provider,
    pub raw_status_code: String,
    pub new_status: TransactionStatus,
    pub reported_amount: Option<String>,
    /// Stamped by the store from the persisted amount while applying the entry.
    #[serde(default)]
    pub expected_amount: Option<String>,
    #[serde(default)]
    pub amount_mismatch: bool,
    pub message: Option<String>,
    pub raw_payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub order_id: String,
    pub provider: Provider,
    pub provider_payment_id: Option<String>,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub settlement_reference: Option<String>,
    pub audit_trail: Vec<AuditEntry>,
    pub polling_disabled: bool,
    /// Last time a polling tick claimed this order. Drives candidate rotation.
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(order_id: String, provider: Provider, amount: BigDecimal, currency: String) -> Self {
        let now = Utc::now();
        Self {
            order_id,
            provider,
            provider_payment_id: None,
            amount,
            currency,
            status: TransactionStatus::Pending,
            settlement_reference: None,
            audit_trail: Vec::new(),
            polling_disabled: false,
            last_polled_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
