//! The single place transaction status changes.
//!
//! Webhooks, polling and manual CLI actions all call [`Reconciler::reconcile`].
//! Correctness under concurrent delivery rests on the store's atomic
//! conditional update, not on anything held in this process.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;

use super::broadcaster::{LiveEvent, Notifier};
use crate::db::{IdempotencyGuard, StatusUpdate, StoreError, TransactionStore};
use crate::domain::{AuditEntry, CanonicalStatus, ProviderEvent, TransactionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied(TransactionStatus),
    SkippedAlreadyTerminal,
    SkippedNotFound,
    SkippedNoChange,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied(_) => "applied",
            ReconcileOutcome::SkippedAlreadyTerminal => "already_terminal",
            ReconcileOutcome::SkippedNotFound => "not_found",
            ReconcileOutcome::SkippedNoChange => "no_change",
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn TransactionStore>,
    notifier: Notifier,
    guard: IdempotencyGuard,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TransactionStore>, notifier: Notifier, guard: IdempotencyGuard) -> Self {
        Self {
            store,
            notifier,
            guard,
        }
    }

    pub fn guard(&self) -> IdempotencyGuard {
        self.guard
    }

    pub async fn reconcile(&self, event: &ProviderEvent) -> Result<ReconcileOutcome, StoreError> {
        if event.canonical_status == CanonicalStatus::Pending {
            if self.store.find_by_order_id(&event.order_id).await?.is_none() {
                tracing::warn!(
                    order_id = %event.order_id,
                    provider = %event.provider,
                    source = %event.source,
                    outcome = "not_found",
                    "Pending event references an unknown order"
                );
                return Ok(ReconcileOutcome::SkippedNotFound);
            }
            tracing::debug!(
                order_id = %event.order_id,
                provider = %event.provider,
                source = %event.source,
                raw_status = %event.raw_status_code,
                "Provider still reports pending"
            );
            return Ok(ReconcileOutcome::SkippedNoChange);
        }

        let status = TransactionStatus::from(event.canonical_status);
        let update = build_update(event, status);

        match self
            .store
            .update_if_open(&event.order_id, self.guard, &update)
            .await?
        {
            Some(tx) => {
                tracing::info!(
                    order_id = %tx.order_id,
                    provider = %event.provider,
                    source = %event.source,
                    status = %status,
                    outcome = "applied",
                    "Transaction status reconciled"
                );
                if tx.audit_trail.last().map(|a| a.amount_mismatch).unwrap_or(false) {
                    tracing::warn!(
                        order_id = %tx.order_id,
                        expected = %tx.amount,
                        reported = ?event.amount,
                        "Reported amount differs from stored amount"
                    );
                }
                if status == TransactionStatus::Completed {
                    self.notifier.notify(LiveEvent::payment_completed(&tx));
                }
                Ok(ReconcileOutcome::Applied(status))
            }
            None => self.classify_skip(event, status).await,
        }
    }

    /// Explains why nothing matched. The lookup only picks a log line and an
    /// outcome; it never feeds back into a write.
    async fn classify_skip(
        &self,
        event: &ProviderEvent,
        status: TransactionStatus,
    ) -> Result<ReconcileOutcome, StoreError> {
        match self.store.find_by_order_id(&event.order_id).await? {
            None => {
                tracing::warn!(
                    order_id = %event.order_id,
                    provider = %event.provider,
                    source = %event.source,
                    outcome = "not_found",
                    "Event references an unknown order"
                );
                Ok(ReconcileOutcome::SkippedNotFound)
            }
            Some(tx) if !self.guard.open_statuses().contains(&tx.status) => {
                tracing::info!(
                    order_id = %event.order_id,
                    provider = %event.provider,
                    source = %event.source,
                    current = %tx.status,
                    reported = %status,
                    outcome = "already_terminal",
                    "Transaction already terminal, ignoring event"
                );
                Ok(ReconcileOutcome::SkippedAlreadyTerminal)
            }
            Some(tx) => {
                tracing::info!(
                    order_id = %event.order_id,
                    source = %event.source,
                    current = %tx.status,
                    outcome = "no_change",
                    "Transaction already in reported status"
                );
                Ok(ReconcileOutcome::SkippedNoChange)
            }
        }
    }
}

fn build_update(event: &ProviderEvent, status: TransactionStatus) -> StatusUpdate {
    let completed = status == TransactionStatus::Completed;

    StatusUpdate {
        status,
        provider_payment_id: event.provider_payment_id.clone().filter(|_| completed),
        settlement_reference: event.settlement_reference.clone().filter(|_| completed),
        reported_amount: event.amount.clone(),
        audit: AuditEntry {
            source: event.source,
            provider: event.provider,
            raw_status_code: event.raw_status_code.clone(),
            new_status: status,
            reported_amount: event.amount.as_ref().map(|a| a.to_string()),
            expected_amount: None,
            amount_mismatch: false,
            message: event.message.clone(),
            raw_payload: event.raw_payload.clone(),
            recorded_at: Utc::now(),
        },
    }
}
