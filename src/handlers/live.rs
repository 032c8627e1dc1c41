use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use tokio::time::{interval_at, Instant};

use crate::services::{LiveEvent, LiveEventKind};
use crate::AppState;

pub const NDJSON: &str = "application/x-ndjson";

/// Long-lived NDJSON stream for one order.
///
/// The first frame is a `connected` handshake. A `payment_completed` frame
/// ends the stream; until then a heartbeat frame keeps intermediaries from
/// closing an idle connection. Clients connecting after completion get
/// nothing but the handshake and should query `GET /orders/:order_id`.
pub async fn live_order(State(state): State<AppState>, Path(order_id): Path<String>) -> Response {
    let mut subscription = state.registry.subscribe(&order_id);
    let heartbeat = state.live_heartbeat;

    tracing::info!(order_id = %order_id, "Live stream opened");

    let stream = async_stream::stream! {
        yield LiveEvent::connected(&order_id).to_ndjson();

        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        loop {
            let next = tokio::select! {
                event = subscription.recv() => event,
                _ = ticker.tick() => Some(LiveEvent::heartbeat(&order_id)),
            };
            let Some(event) = next else { break };

            let finished = event.kind == LiveEventKind::PaymentCompleted;
            yield event.to_ndjson();
            if finished {
                tracing::debug!(order_id = %order_id, "Live stream completed");
                break;
            }
        }
    };

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, NDJSON)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
    {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build live stream response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
