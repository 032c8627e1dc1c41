//! In-process transaction store.
//!
//! The write lock spans the whole check-and-set, which gives the same
//! atomicity the Postgres adapter gets from a single conditional UPDATE.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{IdempotencyGuard, PollCandidates, StatusUpdate, StoreError, StoreResult, TransactionStore};
use crate::domain::{AuditEntry, Transaction, TransactionStatus};

#[derive(Clone, Default)]
pub struct MemoryTransactionStore {
    records: Arc<RwLock<HashMap<String, Transaction>>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

pub(crate) fn stamp_amount(audit: &mut AuditEntry, stored: &BigDecimal, reported: Option<&BigDecimal>) {
    audit.expected_amount = Some(stored.to_string());
    audit.amount_mismatch = reported.map(|amount| amount != stored).unwrap_or(false);
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn insert(&self, tx: &Transaction) -> StoreResult<Transaction> {
        let mut records = self.records.write().await;
        if records.contains_key(&tx.order_id) {
            return Err(StoreError::Duplicate(tx.order_id.clone()));
        }
        records.insert(tx.order_id.clone(), tx.clone());
        Ok(tx.clone())
    }

    async fn update_if_open(
        &self,
        order_id: &str,
        guard: IdempotencyGuard,
        update: &StatusUpdate,
    ) -> StoreResult<Option<Transaction>> {
        let mut records = self.records.write().await;
        let Some(tx) = records.get_mut(order_id) else {
            return Ok(None);
        };
        if !guard.allows(tx.status, update.status) {
            return Ok(None);
        }

        let mut audit = update.audit.clone();
        stamp_amount(&mut audit, &tx.amount, update.reported_amount.as_ref());

        tx.status = update.status;
        if let Some(payment_id) = &update.provider_payment_id {
            tx.provider_payment_id = Some(payment_id.clone());
        }
        if let Some(reference) = &update.settlement_reference {
            tx.settlement_reference = Some(reference.clone());
        }
        tx.audit_trail.push(audit);
        tx.updated_at = Utc::now();

        Ok(Some(tx.clone()))
    }

    async fn find_by_order_id(&self, order_id: &str) -> StoreResult<Option<Transaction>> {
        Ok(self.records.read().await.get(order_id).cloned())
    }

    async fn claim_poll_candidates(&self, query: &PollCandidates) -> StoreResult<Vec<Transaction>> {
        let mut records = self.records.write().await;
        let mut candidates: Vec<&mut Transaction> = records
            .values_mut()
            .filter(|tx| {
                tx.provider == query.provider
                    && tx.status == TransactionStatus::Pending
                    && !tx.polling_disabled
                    && tx.created_at >= query.created_after
            })
            .collect();

        // `None` sorts before `Some`, so never-polled records come first.
        candidates.sort_by(|a, b| {
            a.last_polled_at
                .cmp(&b.last_polled_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        candidates.truncate(query.limit.max(0) as usize);

        Ok(candidates
            .into_iter()
            .map(|tx| {
                tx.last_polled_at = Some(query.polled_at);
                tx.clone()
            })
            .collect())
    }

    async fn disable_polling(&self, order_id: &str) -> StoreResult<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(order_id) {
            Some(tx) if !tx.polling_disabled => {
                tx.polling_disabled = true;
                tx.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
