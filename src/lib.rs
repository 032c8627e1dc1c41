pub mod cli;
pub mod clock;
pub mod codec;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod providers;
pub mod services;
pub mod utils;

use axum::{
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::ProviderCodec;
use crate::db::TransactionStore;
use crate::domain::Provider;
use crate::middleware::request_logger::{request_logger_middleware, RequestLogSettings};
use crate::services::{Reconciler, SubscriberRegistry};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TransactionStore>,
    pub reconciler: Reconciler,
    pub codecs: Arc<HashMap<Provider, ProviderCodec>>,
    pub registry: Arc<SubscriberRegistry>,
    pub live_heartbeat: Duration,
    pub request_log: RequestLogSettings,
}

pub fn create_app(state: AppState) -> Router {
    let request_log = state.request_log;

    Router::new()
        .route("/health", get(handlers::health))
        .route("/webhooks/:provider", post(handlers::webhook::receive))
        .route("/orders/:order_id", get(handlers::transactions::get_order))
        .route("/orders/:order_id/live", get(handlers::live::live_order))
        .layer(axum::middleware::from_fn_with_state(
            request_log,
            request_logger_middleware,
        ))
        .with_state(state)
}
