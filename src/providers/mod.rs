//! Outbound provider status queries used by the polling scheduler.

pub mod client;

use async_trait::async_trait;
use thiserror::Error;

use crate::codec::CodecError;
use crate::domain::{Provider, ProviderEvent};

pub use client::HttpStatusClient;

#[derive(Error, Debug)]
pub enum StatusQueryError {
    #[error("Provider denied access to order status (HTTP {status}, code {code:?})")]
    PermissionDenied { status: u16, code: Option<String> },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Provider status API returned HTTP {status}")]
    Upstream { status: u16 },

    #[error("Invalid status response: {0}")]
    Decode(#[from] CodecError),

    #[error("Status response for order {actual} does not match queried order {expected}")]
    OrderMismatch { expected: String, actual: String },

    #[error("Cannot build status URL: {0}")]
    InvalidUrl(String),

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(Provider),
}

impl StatusQueryError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, StatusQueryError::PermissionDenied { .. })
    }

    /// Failures that say the provider itself is unhealthy, as opposed to an
    /// answer about one particular order.
    pub fn is_transient(&self) -> bool {
        match self {
            StatusQueryError::Request(_) | StatusQueryError::CircuitOpen(_) => true,
            StatusQueryError::Upstream { status } => *status >= 500,
            _ => false,
        }
    }
}

/// A provider's status-query API.
#[async_trait]
pub trait StatusQuery: Send + Sync {
    fn provider(&self) -> Provider;

    /// Asks the provider for the current status of `order_id`. A successful
    /// answer is returned as an event tagged `source: poll`.
    async fn query_status(&self, order_id: &str) -> Result<ProviderEvent, StatusQueryError>;
}
