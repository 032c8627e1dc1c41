//! Transaction store contract and its adapters.
//!
//! The reconciliation core never read-modify-writes a transaction. Every
//! state transition goes through [`TransactionStore::update_if_open`],
//! which must be a single atomic conditional update at the storage layer.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::str::FromStr;
use thiserror::Error;

use crate::domain::{AuditEntry, Provider, Transaction, TransactionStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemoryTransactionStore;
pub use postgres::PostgresTransactionStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transaction already exists for order {0}")]
    Duplicate(String),

    #[error("Corrupt record for order {order_id}: {reason}")]
    Corrupt { order_id: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Which current statuses a reconciliation write may transition out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdempotencyGuard {
    /// Only `pending` is open; `completed`, `failed` and `refunded` are frozen.
    #[default]
    NotTerminal,
    /// `failed` stays open as well, permitting `failed -> completed` recovery.
    AllowFailedRecovery,
}

impl IdempotencyGuard {
    pub fn open_statuses(&self) -> &'static [TransactionStatus] {
        match self {
            IdempotencyGuard::NotTerminal => &[TransactionStatus::Pending],
            IdempotencyGuard::AllowFailedRecovery => {
                &[TransactionStatus::Pending, TransactionStatus::Failed]
            }
        }
    }

    pub fn allows(&self, current: TransactionStatus, next: TransactionStatus) -> bool {
        current != next && self.open_statuses().contains(&current)
    }
}

impl FromStr for IdempotencyGuard {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "not_terminal" => Ok(IdempotencyGuard::NotTerminal),
            "allow_failed_recovery" => Ok(IdempotencyGuard::AllowFailedRecovery),
            other => Err(format!(
                "unknown reconcile guard '{}', expected not_terminal or allow_failed_recovery",
                other
            )),
        }
    }
}

/// Everything a single reconciliation write sets, applied atomically.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: TransactionStatus,
    pub provider_payment_id: Option<String>,
    pub settlement_reference: Option<String>,
    pub reported_amount: Option<BigDecimal>,
    pub audit: AuditEntry,
}

/// Candidate selection for one polling tick.
#[derive(Debug, Clone)]
pub struct PollCandidates {
    pub provider: Provider,
    pub created_after: DateTime<Utc>,
    pub limit: i64,
    /// Stamped into `last_polled_at` of every claimed record.
    pub polled_at: DateTime<Utc>,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn insert(&self, tx: &Transaction) -> StoreResult<Transaction>;

    /// Applies `update` to the record for `order_id` only if its current
    /// status is open under `guard` and differs from `update.status`.
    /// Returns the updated record, or `None` when nothing matched.
    async fn update_if_open(
        &self,
        order_id: &str,
        guard: IdempotencyGuard,
        update: &StatusUpdate,
    ) -> StoreResult<Option<Transaction>>;

    /// Diagnostic lookup. Never used to decide a transition.
    async fn find_by_order_id(&self, order_id: &str) -> StoreResult<Option<Transaction>>;

    /// Claims up to `limit` pollable records (pending, polling enabled, this
    /// provider, created inside the window), least recently polled first
    /// with never-polled records ahead of all others, and stamps their
    /// `last_polled_at` with `query.polled_at`. Orders that stay pending
    /// forever therefore rotate to the back instead of starving newer ones.
    async fn claim_poll_candidates(&self, query: &PollCandidates) -> StoreResult<Vec<Transaction>>;

    /// Marks the transaction as excluded from polling. Returns `false` if it
    /// was already disabled or does not exist.
    async fn disable_polling(&self, order_id: &str) -> StoreResult<bool>;

    async fn ping(&self) -> StoreResult<()>;
}

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_terminal_guard() {
        let guard = IdempotencyGuard::NotTerminal;
        assert!(guard.allows(TransactionStatus::Pending, TransactionStatus::Completed));
        assert!(guard.allows(TransactionStatus::Pending, TransactionStatus::Failed));
        assert!(!guard.allows(TransactionStatus::Failed, TransactionStatus::Completed));
        assert!(!guard.allows(TransactionStatus::Completed, TransactionStatus::Failed));
        assert!(!guard.allows(TransactionStatus::Refunded, TransactionStatus::Completed));
    }

    #[test]
    fn test_failed_recovery_guard() {
        let guard = IdempotencyGuard::AllowFailedRecovery;
        assert!(guard.allows(TransactionStatus::Failed, TransactionStatus::Completed));
        assert!(!guard.allows(TransactionStatus::Failed, TransactionStatus::Failed));
        assert!(!guard.allows(TransactionStatus::Completed, TransactionStatus::Failed));
        assert!(!guard.allows(TransactionStatus::Refunded, TransactionStatus::Completed));
    }

    #[test]
    fn test_guard_from_str() {
        assert_eq!("not_terminal".parse(), Ok(IdempotencyGuard::NotTerminal));
        assert_eq!(
            "ALLOW_FAILED_RECOVERY".parse(),
            Ok(IdempotencyGuard::AllowFailedRecovery)
        );
        assert!("lenient".parse::<IdempotencyGuard>().is_err());
    }
}
