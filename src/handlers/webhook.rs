use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::codec::RawWebhook;
use crate::domain::Provider;
use crate::error::AppError;
use crate::services::ReconcileOutcome;
use crate::AppState;

fn ack(status: StatusCode, outcome: &str) -> Response {
    (status, Json(json!({ "status": outcome }))).into_response()
}

/// Inbound provider webhook.
///
/// Anything that parses far enough to be trusted is acknowledged with 200,
/// whatever reconciliation made of it. Only a payload whose authenticity
/// cannot be established is answered with 400.
pub async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let provider: Provider = provider
        .parse()
        .map_err(|_| AppError::NotFound(format!("webhook provider '{}'", provider)))?;
    let codec = state
        .codecs
        .get(&provider)
        .ok_or_else(|| AppError::NotFound(format!("webhook provider '{}' is not configured", provider)))?;

    let signature = codec
        .signature_header()
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok());
    let raw = RawWebhook {
        body: &body,
        signature,
    };

    let event = match codec.decode_webhook(&raw) {
        Ok(event) => event,
        Err(e) if e.is_authentication_failure() => {
            tracing::warn!(
                provider = %provider,
                body_len = body.len(),
                error = %e,
                "Rejected webhook with unverifiable authenticity"
            );
            return Ok(ack(StatusCode::BAD_REQUEST, "rejected"));
        }
        Err(e) => {
            tracing::warn!(
                provider = %provider,
                body_len = body.len(),
                error = %e,
                "Acknowledging undecodable webhook"
            );
            return Ok(ack(StatusCode::OK, "ignored"));
        }
    };

    let outcome = match state.reconciler.reconcile(&event).await {
        Ok(ReconcileOutcome::Applied(_)) => "applied",
        Ok(ReconcileOutcome::SkippedAlreadyTerminal) => "duplicate",
        Ok(ReconcileOutcome::SkippedNotFound) => "unknown_order",
        Ok(ReconcileOutcome::SkippedNoChange) => "no_change",
        Err(e) => {
            // Acknowledged anyway; the poller picks the order up again.
            tracing::error!(
                order_id = %event.order_id,
                provider = %provider,
                source = "webhook",
                error = %e,
                "Failed to reconcile webhook"
            );
            "accepted"
        }
    };

    Ok(ack(StatusCode::OK, outcome))
}
