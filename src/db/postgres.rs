//! Postgres implementation of TransactionStore.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;

use super::{IdempotencyGuard, PollCandidates, StatusUpdate, StoreError, StoreResult, TransactionStore};
use crate::domain::{AuditEntry, Transaction};

const RETURNING: &str = "order_id, provider, provider_payment_id, amount, currency, status, \
     settlement_reference, audit_trail, polling_disabled, last_polled_at, created_at, updated_at";

/// Postgres-backed transaction store.
#[derive(Clone)]
pub struct PostgresTransactionStore {
    pool: PgPool,
}

impl PostgresTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionStore for PostgresTransactionStore {
    async fn insert(&self, tx: &Transaction) -> StoreResult<Transaction> {
        let sql = format!(
            r#"
            INSERT INTO transactions (
                order_id, provider, provider_payment_id, amount, currency, status,
                settlement_reference, audit_trail, polling_disabled, last_polled_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            RETURNING
        );

        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(&tx.order_id)
            .bind(tx.provider.as_str())
            .bind(&tx.provider_payment_id)
            .bind(&tx.amount)
            .bind(&tx.currency)
            .bind(tx.status.as_str())
            .bind(&tx.settlement_reference)
            .bind(Json(&tx.audit_trail))
            .bind(tx.polling_disabled)
            .bind(tx.last_polled_at)
            .bind(tx.created_at)
            .bind(tx.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    StoreError::Duplicate(tx.order_id.clone())
                }
                _ => StoreError::from(e),
            })?;

        row.into_domain()
    }

    async fn update_if_open(
        &self,
        order_id: &str,
        guard: IdempotencyGuard,
        update: &StatusUpdate,
    ) -> StoreResult<Option<Transaction>> {
        // Guard check, field writes and the audit append (stamped with the
        // stored amount) happen in one statement.
        let sql = format!(
            r#"
            UPDATE transactions
            SET status = $2,
                provider_payment_id = COALESCE($3, provider_payment_id),
                settlement_reference = COALESCE($4, settlement_reference),
                audit_trail = audit_trail || jsonb_build_array(
                    $5::jsonb || jsonb_build_object(
                        'expected_amount', amount::text,
                        'amount_mismatch', COALESCE($6::numeric <> amount, FALSE)
                    )
                ),
                updated_at = NOW()
            WHERE order_id = $1
              AND status = ANY($7)
              AND status <> $2
            RETURNING {}
            "#,
            RETURNING
        );

        let open: Vec<String> = guard
            .open_statuses()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(order_id)
            .bind(update.status.as_str())
            .bind(&update.provider_payment_id)
            .bind(&update.settlement_reference)
            .bind(Json(&update.audit))
            .bind(&update.reported_amount)
            .bind(&open)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn find_by_order_id(&self, order_id: &str) -> StoreResult<Option<Transaction>> {
        let sql = format!("SELECT {} FROM transactions WHERE order_id = $1", RETURNING);
        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn claim_poll_candidates(&self, query: &PollCandidates) -> StoreResult<Vec<Transaction>> {
        // SKIP LOCKED keeps two pollers from claiming the same rows.
        let sql = format!(
            r#"
            UPDATE transactions
            SET last_polled_at = $4
            WHERE order_id IN (
                SELECT order_id
                FROM transactions
                WHERE provider = $1
                  AND status = 'pending'
                  AND polling_disabled = FALSE
                  AND created_at >= $2
                ORDER BY last_polled_at ASC NULLS FIRST, created_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            RETURNING
        );

        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(query.provider.as_str())
            .bind(query.created_after)
            .bind(query.limit)
            .bind(query.polled_at)
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = rows
            .into_iter()
            .map(TransactionRow::into_domain)
            .collect::<StoreResult<Vec<_>>>()?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(claimed)
    }

    async fn disable_polling(&self, order_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE transactions SET polling_disabled = TRUE, updated_at = NOW() \
             WHERE order_id = $1 AND polling_disabled = FALSE",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    order_id: String,
    provider: String,
    provider_payment_id: Option<String>,
    amount: BigDecimal,
    currency: String,
    status: String,
    settlement_reference: Option<String>,
    audit_trail: Json<Vec<AuditEntry>>,
    polling_disabled: bool,
    last_polled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_domain(self) -> StoreResult<Transaction> {
        let corrupt = |reason: String| StoreError::Corrupt {
            order_id: self.order_id.clone(),
            reason,
        };
        let provider = self.provider.parse().map_err(corrupt)?;
        let status = self.status.parse().map_err(corrupt)?;

        Ok(Transaction {
            order_id: self.order_id,
            provider,
            provider_payment_id: self.provider_payment_id,
            amount: self.amount,
            currency: self.currency,
            status,
            settlement_reference: self.settlement_reference,
            audit_trail: self.audit_trail.0,
            polling_disabled: self.polling_disabled,
            last_polled_at: self.last_polled_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
