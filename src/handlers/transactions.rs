use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{Provider, Transaction, TransactionStatus};
use crate::error::AppError;
use crate::AppState;

/// Order status as shown to the paying client.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusView {
    pub order_id: String,
    pub provider: Provider,
    pub status: TransactionStatus,
    pub amount: String,
    pub currency: String,
    pub provider_payment_id: Option<String>,
    pub settlement_reference: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<Transaction> for OrderStatusView {
    fn from(tx: Transaction) -> Self {
        Self {
            amount: tx.amount.to_string(),
            order_id: tx.order_id,
            provider: tx.provider,
            status: tx.status,
            currency: tx.currency,
            provider_payment_id: tx.provider_payment_id,
            settlement_reference: tx.settlement_reference,
            updated_at: tx.updated_at,
        }
    }
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderStatusView>, AppError> {
    let tx = state
        .store
        .find_by_order_id(&order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {}", order_id)))?;

    Ok(Json(tx.into()))
}
