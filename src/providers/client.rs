use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use async_trait::async_trait;

use super::{StatusQuery, StatusQueryError};
use crate::codec::ProviderCodec;
use crate::domain::{EventSource, Provider, ProviderEvent};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Error codes a provider uses in a response body to say this merchant may
/// not query this order.
pub const PERMISSION_DENIED_CODES: &[&str] = &[
    "PERMISSION_DENIED",
    "ACCESS_DENIED",
    "NOT_ENTITLED",
    "UNAUTHORIZED",
];

type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>;

/// HTTP client for one provider's status-query API.
///
/// Transport failures and 5xx answers feed a provider-wide circuit breaker;
/// per-order answers (permission denied, undecodable body) do not.
#[derive(Clone)]
pub struct HttpStatusClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    codec: ProviderCodec,
    circuit_breaker: Breaker,
}

impl HttpStatusClient {
    pub fn new(codec: ProviderCodec, base_url: String, api_key: Option<String>) -> Self {
        Self::with_circuit_breaker(codec, base_url, api_key, 5, 60)
    }

    pub fn with_circuit_breaker(
        codec: ProviderCodec,
        base_url: String,
        api_key: Option<String>,
        failure_threshold: u32,
        reset_timeout_secs: u64,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(
            Duration::from_secs(reset_timeout_secs),
            Duration::from_secs(reset_timeout_secs * 2),
        );
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        Self {
            client,
            base_url,
            api_key,
            codec,
            circuit_breaker,
        }
    }

    /// The order id is pushed as one path segment, so reserved characters
    /// in it are percent-encoded rather than read as path structure.
    pub fn status_url(&self, order_id: &str) -> Result<Url, StatusQueryError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| StatusQueryError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        let segments: &[&str] = match self.codec.provider() {
            Provider::GatewayA => &["status", order_id],
            Provider::GatewayB => &["v1", "orders", order_id],
            Provider::GatewayC => &["api", "orders", order_id, "status"],
        };
        url.path_segments_mut()
            .map_err(|_| StatusQueryError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn circuit_state(&self) -> &'static str {
        if self.circuit_breaker.is_call_permitted() {
            "closed"
        } else {
            "open"
        }
    }
}

#[async_trait]
impl StatusQuery for HttpStatusClient {
    fn provider(&self) -> Provider {
        self.codec.provider()
    }

    async fn query_status(&self, order_id: &str) -> Result<ProviderEvent, StatusQueryError> {
        let provider = self.provider();
        let url = self.status_url(order_id)?;
        let client = self.client.clone();
        let api_key = self.api_key.clone();

        let result = self
            .circuit_breaker
            .call_with(
                |e: &StatusQueryError| e.is_transient(),
                async move {
                    let mut request = client.get(url).header(ACCEPT, "application/json");
                    if let Some(key) = api_key {
                        request = request.header(API_KEY_HEADER, key);
                    }

                    let response = request.send().await?;
                    let status = response.status();
                    let body = response.bytes().await?;
                    classify(status, &body)?;
                    Ok::<_, StatusQueryError>(body)
                },
            )
            .await;

        let body = match result {
            Ok(body) => body,
            Err(FailsafeError::Rejected) => return Err(StatusQueryError::CircuitOpen(provider)),
            Err(FailsafeError::Inner(e)) => return Err(e),
        };

        let event = self.codec.decode_status_response(&body)?;
        if event.order_id != order_id {
            tracing::warn!(
                provider = %provider,
                order_id = %order_id,
                answered_for = %event.order_id,
                "Status response names a different order"
            );
            return Err(StatusQueryError::OrderMismatch {
                expected: order_id.to_string(),
                actual: event.order_id,
            });
        }

        Ok(event.with_source(EventSource::Poll))
    }
}

fn classify(status: StatusCode, body: &[u8]) -> Result<(), StatusQueryError> {
    let code = error_code(body);

    let denied = status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || code
            .as_deref()
            .map(|c| PERMISSION_DENIED_CODES.contains(&c))
            .unwrap_or(false);
    if denied {
        return Err(StatusQueryError::PermissionDenied {
            status: status.as_u16(),
            code,
        });
    }

    if !status.is_success() {
        return Err(StatusQueryError::Upstream {
            status: status.as_u16(),
        });
    }
    Ok(())
}

fn error_code(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    ["code", "errorCode", "error_code", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(|code| code.trim().to_ascii_uppercase())
}
