//! Polling safety net for webhooks that never arrive.
//!
//! One [`ProviderPoller`] per provider with a status API. Each tick selects
//! recent pending transactions, asks the provider about them one at a time
//! and feeds the answers through the same [`Reconciler`] webhooks use.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::reconciler::{ReconcileOutcome, Reconciler};
use crate::clock::Clock;
use crate::db::{PollCandidates, TransactionStore};
use crate::domain::{Provider, Transaction, TransactionStatus};
use crate::providers::StatusQuery;

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub interval: Duration,
    pub window: chrono::Duration,
    pub batch_limit: i64,
    pub call_delay: Duration,
    pub denial_threshold: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            window: chrono::Duration::hours(24),
            batch_limit: 25,
            call_delay: Duration::from_millis(500),
            denial_threshold: 3,
        }
    }
}

/// What one tick did, mostly for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub candidates: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub denied: usize,
    pub disabled: usize,
    pub failed: usize,
}

pub struct ProviderPoller {
    client: Arc<dyn StatusQuery>,
    store: Arc<dyn TransactionStore>,
    reconciler: Reconciler,
    clock: Arc<dyn Clock>,
    config: PollingConfig,
    /// Consecutive permission-denied answers per order.
    denials: HashMap<String, u32>,
}

impl ProviderPoller {
    pub fn new(
        client: Arc<dyn StatusQuery>,
        store: Arc<dyn TransactionStore>,
        reconciler: Reconciler,
        clock: Arc<dyn Clock>,
        config: PollingConfig,
    ) -> Self {
        Self {
            client,
            store,
            reconciler,
            clock,
            config,
            denials: HashMap::new(),
        }
    }

    pub fn provider(&self) -> Provider {
        self.client.provider()
    }

    pub async fn tick(&mut self) -> TickReport {
        let provider = self.provider();
        let mut report = TickReport::default();

        let now = self.clock.now();
        let Some(created_after) = now.checked_sub_signed(self.config.window) else {
            tracing::error!(provider = %provider, "Polling window reaches before the representable time range");
            return report;
        };
        let query = PollCandidates {
            provider,
            created_after,
            limit: self.config.batch_limit,
            polled_at: now,
        };
        let candidates = match self.store.claim_poll_candidates(&query).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!(provider = %provider, error = %e, "Failed to load polling candidates");
                return report;
            }
        };
        report.candidates = candidates.len();

        self.prune_denials(&candidates, created_after).await;

        for (i, tx) in candidates.iter().enumerate() {
            if i > 0 && !self.config.call_delay.is_zero() {
                tokio::time::sleep(self.config.call_delay).await;
            }
            self.poll_one(&tx.order_id, &mut report).await;
        }

        if report.candidates > 0 {
            tracing::info!(
                provider = %provider,
                candidates = report.candidates,
                applied = report.applied,
                unchanged = report.unchanged,
                denied = report.denied,
                disabled = report.disabled,
                failed = report.failed,
                "Polling tick finished"
            );
        }
        report
    }

    /// Drops denial counts for orders that can no longer be polled. Orders
    /// that merely rotated out of this batch keep their count.
    async fn prune_denials(&mut self, batch: &[Transaction], created_after: DateTime<Utc>) {
        let absent: Vec<String> = self
            .denials
            .keys()
            .filter(|order_id| !batch.iter().any(|tx| &tx.order_id == *order_id))
            .cloned()
            .collect();

        for order_id in absent {
            let pollable = match self.store.find_by_order_id(&order_id).await {
                Ok(Some(tx)) => {
                    tx.status == TransactionStatus::Pending
                        && !tx.polling_disabled
                        && tx.created_at >= created_after
                }
                Ok(None) => false,
                // Keep the count until the store answers.
                Err(_) => true,
            };
            if !pollable {
                self.denials.remove(&order_id);
            }
        }
    }

    async fn poll_one(&mut self, order_id: &str, report: &mut TickReport) {
        let provider = self.provider();

        match self.client.query_status(order_id).await {
            Ok(event) => {
                self.denials.remove(order_id);
                match self.reconciler.reconcile(&event).await {
                    Ok(ReconcileOutcome::Applied(_)) => report.applied += 1,
                    Ok(_) => report.unchanged += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(
                            order_id = %order_id,
                            provider = %provider,
                            source = "poll",
                            error = %e,
                            "Failed to reconcile polled status, will retry next tick"
                        );
                    }
                }
            }
            Err(e) if e.is_permission_denied() => {
                report.denied += 1;
                let count = self.denials.entry(order_id.to_string()).or_insert(0);
                *count += 1;
                let count = *count;
                tracing::warn!(
                    order_id = %order_id,
                    provider = %provider,
                    consecutive = count,
                    threshold = self.config.denial_threshold,
                    error = %e,
                    "Provider denied status query"
                );

                if count >= self.config.denial_threshold {
                    match self.store.disable_polling(order_id).await {
                        Ok(_) => {
                            report.disabled += 1;
                            self.denials.remove(order_id);
                            tracing::warn!(
                                order_id = %order_id,
                                provider = %provider,
                                "Polling disabled for order, relying on webhook delivery"
                            );
                        }
                        Err(e) => tracing::error!(
                            order_id = %order_id,
                            provider = %provider,
                            error = %e,
                            "Failed to persist polling-disabled flag"
                        ),
                    }
                }
            }
            Err(e) => {
                report.failed += 1;
                if !e.is_transient() {
                    self.denials.remove(order_id);
                }
                tracing::warn!(
                    order_id = %order_id,
                    provider = %provider,
                    transient = e.is_transient(),
                    error = %e,
                    "Status query failed, will retry next tick"
                );
            }
        }
    }
}

/// Owns the per-provider polling tasks.
pub struct PollingScheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<(Provider, JoinHandle<()>)>,
}

impl PollingScheduler {
    /// Spawns one recurring task per poller. Each runs a pass immediately,
    /// then every `interval`.
    pub fn start(pollers: Vec<ProviderPoller>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::with_capacity(pollers.len());

        for mut poller in pollers {
            let provider = poller.provider();
            let period = poller.config.interval;
            let mut shutdown_rx = shutdown.subscribe();

            let handle = tokio::spawn(async move {
                tracing::info!(
                    provider = %provider,
                    interval_secs = period.as_secs(),
                    "Polling scheduler started"
                );
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = ticker.tick() => {
                            tokio::select! {
                                _ = shutdown_rx.changed() => break,
                                _ = poller.tick() => {}
                            }
                        }
                    }
                }
                tracing::info!(provider = %provider, "Polling scheduler stopped");
            });
            handles.push((provider, handle));
        }

        Self { shutdown, handles }
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.handles.iter().map(|(provider, _)| *provider).collect()
    }

    /// Cancels every polling task and waits for them to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for (provider, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(provider = %provider, "Polling task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bigdecimal::BigDecimal;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::clock::ManualClock;
    use crate::db::{IdempotencyGuard, MemoryTransactionStore, StatusUpdate, StoreError, StoreResult};
    use crate::domain::{CanonicalStatus, EventSource, ProviderEvent, Transaction, TransactionStatus};
    use crate::providers::StatusQueryError;
    use crate::services::broadcaster::Notifier;

    #[derive(Clone, Copy)]
    enum Reply {
        Status(CanonicalStatus),
        Denied,
        Unreachable,
    }

    #[derive(Default)]
    struct ScriptedStatus {
        replies: Mutex<HashMap<String, Reply>>,
        calls: AtomicUsize,
    }

    impl ScriptedStatus {
        fn set(&self, order_id: &str, reply: Reply) {
            self.replies.lock().unwrap().insert(order_id.to_string(), reply);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusQuery for ScriptedStatus {
        fn provider(&self) -> Provider {
            Provider::GatewayA
        }

        async fn query_status(&self, order_id: &str) -> Result<ProviderEvent, StatusQueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .get(order_id)
                .copied()
                .unwrap_or(Reply::Status(CanonicalStatus::Pending));

            match reply {
                Reply::Status(status) => Ok(ProviderEvent {
                    provider: Provider::GatewayA,
                    order_id: order_id.to_string(),
                    provider_payment_id: Some("txn-1".to_string()),
                    settlement_reference: Some("UTR777".to_string()),
                    raw_status_code: "X".to_string(),
                    canonical_status: status,
                    amount: None,
                    message: None,
                    source: EventSource::Poll,
                    raw_payload: json!({}),
                }),
                Reply::Denied => Err(StatusQueryError::PermissionDenied {
                    status: 403,
                    code: None,
                }),
                Reply::Unreachable => Err(StatusQueryError::Upstream { status: 503 }),
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryTransactionStore>,
        status: Arc<ScriptedStatus>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        async fn new(order_ids: &[&str]) -> Self {
            let store = Arc::new(MemoryTransactionStore::new());
            for order_id in order_ids {
                store
                    .insert(&Transaction::new(
                        order_id.to_string(),
                        Provider::GatewayA,
                        BigDecimal::from(100),
                        "INR".to_string(),
                    ))
                    .await
                    .unwrap();
            }
            Self {
                store,
                status: Arc::new(ScriptedStatus::default()),
                clock: Arc::new(ManualClock::new(chrono::Utc::now())),
            }
        }

        fn poller(&self, config: PollingConfig) -> ProviderPoller {
            self.poller_on(self.store.clone(), config)
        }

        fn poller_on(&self, store: Arc<dyn TransactionStore>, config: PollingConfig) -> ProviderPoller {
            let (notifier, _rx) = Notifier::detached();
            let reconciler = Reconciler::new(store.clone(), notifier, IdempotencyGuard::NotTerminal);
            ProviderPoller::new(self.status.clone(), store, reconciler, self.clock.clone(), config)
        }

        async fn insert_at(&self, order_id: &str, created_at: chrono::DateTime<chrono::Utc>) {
            let mut tx = Transaction::new(
                order_id.to_string(),
                Provider::GatewayA,
                BigDecimal::from(100),
                "INR".to_string(),
            );
            tx.created_at = created_at;
            self.store.insert(&tx).await.unwrap();
        }
    }

    /// Reads work, every status write fails as if the database were down.
    struct WritesUnavailable(Arc<MemoryTransactionStore>);

    #[async_trait]
    impl TransactionStore for WritesUnavailable {
        async fn insert(&self, tx: &Transaction) -> StoreResult<Transaction> {
            self.0.insert(tx).await
        }

        async fn update_if_open(
            &self,
            _order_id: &str,
            _guard: IdempotencyGuard,
            _update: &StatusUpdate,
        ) -> StoreResult<Option<Transaction>> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn find_by_order_id(&self, order_id: &str) -> StoreResult<Option<Transaction>> {
            self.0.find_by_order_id(order_id).await
        }

        async fn claim_poll_candidates(&self, query: &PollCandidates) -> StoreResult<Vec<Transaction>> {
            self.0.claim_poll_candidates(query).await
        }

        async fn disable_polling(&self, order_id: &str) -> StoreResult<bool> {
            self.0.disable_polling(order_id).await
        }

        async fn ping(&self) -> StoreResult<()> {
            self.0.ping().await
        }
    }

    fn fast_config() -> PollingConfig {
        PollingConfig {
            call_delay: Duration::ZERO,
            ..PollingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pending_answer_leaves_record_unchanged() {
        let fixture = Fixture::new(&["ORD_2"]).await;
        let mut poller = fixture.poller(fast_config());

        let report = poller.tick().await;
        assert_eq!(report.candidates, 1);
        assert_eq!(report.unchanged, 1);

        let tx = fixture.store.find_by_order_id("ORD_2").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(tx.audit_trail.is_empty());
    }

    #[tokio::test]
    async fn test_completed_answer_is_reconciled_as_poll() {
        let fixture = Fixture::new(&["ORD_1"]).await;
        fixture.status.set("ORD_1", Reply::Status(CanonicalStatus::Completed));
        let mut poller = fixture.poller(fast_config());

        assert_eq!(poller.tick().await.applied, 1);
        let tx = fixture.store.find_by_order_id("ORD_1").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.audit_trail[0].source, EventSource::Poll);

        // No longer pending, so never asked again.
        assert_eq!(poller.tick().await.candidates, 0);
        assert_eq!(fixture.status.calls(), 1);
    }

    #[tokio::test]
    async fn test_repeated_denial_disables_polling() {
        let fixture = Fixture::new(&["ORD_3"]).await;
        fixture.status.set("ORD_3", Reply::Denied);
        let mut poller = fixture.poller(fast_config());

        assert_eq!(poller.tick().await.disabled, 0);
        assert_eq!(poller.tick().await.disabled, 0);
        assert_eq!(poller.tick().await.disabled, 1);

        let tx = fixture.store.find_by_order_id("ORD_3").await.unwrap().unwrap();
        assert!(tx.polling_disabled);
        assert_eq!(tx.status, TransactionStatus::Pending);

        let report = poller.tick().await;
        assert_eq!(report.candidates, 0);
        assert_eq!(fixture.status.calls(), 3);
    }

    #[tokio::test]
    async fn test_other_answers_reset_denial_count() {
        let fixture = Fixture::new(&["ORD_3"]).await;
        let mut poller = fixture.poller(fast_config());

        fixture.status.set("ORD_3", Reply::Denied);
        poller.tick().await;
        poller.tick().await;

        fixture.status.set("ORD_3", Reply::Status(CanonicalStatus::Pending));
        poller.tick().await;

        fixture.status.set("ORD_3", Reply::Denied);
        poller.tick().await;
        assert_eq!(poller.tick().await.disabled, 0);
        assert_eq!(poller.tick().await.disabled, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_order_in_rotation() {
        let fixture = Fixture::new(&["ORD_5"]).await;
        fixture.status.set("ORD_5", Reply::Unreachable);
        let mut poller = fixture.poller(fast_config());

        for _ in 0..5 {
            let report = poller.tick().await;
            assert_eq!(report.failed, 1);
            assert_eq!(report.disabled, 0);
        }
        let tx = fixture.store.find_by_order_id("ORD_5").await.unwrap().unwrap();
        assert!(!tx.polling_disabled);
    }

    #[tokio::test]
    async fn test_recency_window_and_batch_limit() {
        let fixture = Fixture::new(&["A", "B", "C"]).await;
        let mut poller = fixture.poller(PollingConfig {
            batch_limit: 2,
            ..fast_config()
        });

        assert_eq!(poller.tick().await.candidates, 2);

        fixture.clock.advance(chrono::Duration::hours(25));
        assert_eq!(poller.tick().await.candidates, 0);
    }

    #[tokio::test]
    async fn test_saturated_batch_still_reaches_newer_orders() {
        let fixture = Fixture::new(&[]).await;
        let created = chrono::Utc::now() - chrono::Duration::hours(1);
        fixture.insert_at("OLD_1", created).await;
        fixture.insert_at("OLD_2", created + chrono::Duration::seconds(1)).await;
        fixture.insert_at("NEW", created + chrono::Duration::minutes(30)).await;
        fixture.status.set("NEW", Reply::Status(CanonicalStatus::Completed));

        let mut poller = fixture.poller(PollingConfig {
            batch_limit: 2,
            ..fast_config()
        });

        let mut applied = 0;
        for _ in 0..3 {
            applied += poller.tick().await.applied;
            fixture.clock.advance(chrono::Duration::minutes(1));
        }

        assert_eq!(applied, 1);
        let tx = fixture.store.find_by_order_id("NEW").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);

        // The abandoned orders keep rotating without starving anyone.
        let old = fixture.store.find_by_order_id("OLD_1").await.unwrap().unwrap();
        assert_eq!(old.status, TransactionStatus::Pending);
        assert!(old.last_polled_at.is_some());
    }

    #[tokio::test]
    async fn test_denial_count_survives_rotation() {
        let fixture = Fixture::new(&[]).await;
        let created = chrono::Utc::now() - chrono::Duration::hours(1);
        fixture.insert_at("DENIED", created).await;
        fixture.insert_at("WAITING", created + chrono::Duration::seconds(1)).await;
        fixture.status.set("DENIED", Reply::Denied);
        let mut poller = fixture.poller(PollingConfig {
            batch_limit: 1,
            ..fast_config()
        });

        let mut disabled = 0;
        for _ in 0..5 {
            disabled += poller.tick().await.disabled;
            fixture.clock.advance(chrono::Duration::minutes(1));
        }

        // DENIED is queried on ticks 1, 3 and 5 and crosses the threshold.
        assert_eq!(disabled, 1);
        let tx = fixture.store.find_by_order_id("DENIED").await.unwrap().unwrap();
        assert!(tx.polling_disabled);
    }

    #[tokio::test]
    async fn test_store_write_failure_is_counted_and_retried() {
        let fixture = Fixture::new(&["ORD_W"]).await;
        fixture.status.set("ORD_W", Reply::Status(CanonicalStatus::Completed));
        let mut poller = fixture.poller_on(
            Arc::new(WritesUnavailable(fixture.store.clone())),
            fast_config(),
        );

        let report = poller.tick().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 0);

        // Still pending, so the next tick asks again.
        fixture.clock.advance(chrono::Duration::minutes(1));
        assert_eq!(poller.tick().await.failed, 1);
        assert_eq!(fixture.status.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_keeps_ticking_through_store_failures() {
        let fixture = Fixture::new(&["ORD_W"]).await;
        fixture.status.set("ORD_W", Reply::Status(CanonicalStatus::Completed));
        let scheduler = PollingScheduler::start(vec![fixture.poller_on(
            Arc::new(WritesUnavailable(fixture.store.clone())),
            fast_config(),
        )]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fixture.status.calls(), 1);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fixture.status.calls(), 3);

        scheduler.stop().await;
        let tx = fixture.store.find_by_order_id("ORD_W").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_window_overflow_skips_tick() {
        let fixture = Fixture::new(&["ORD_1"]).await;
        let mut poller = fixture.poller(PollingConfig {
            window: chrono::Duration::MAX,
            ..fast_config()
        });

        assert_eq!(poller.tick().await, TickReport::default());
        assert_eq!(fixture.status.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_runs_immediately_then_periodically() {
        let fixture = Fixture::new(&["ORD_2"]).await;
        let scheduler = PollingScheduler::start(vec![fixture.poller(fast_config())]);
        assert_eq!(scheduler.providers(), vec![Provider::GatewayA]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fixture.status.calls(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fixture.status.calls(), 2);

        scheduler.stop().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(fixture.status.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_delay_spaces_out_queries() {
        let fixture = Fixture::new(&["A", "B", "C"]).await;
        let mut poller = fixture.poller(PollingConfig::default());

        let started = tokio::time::Instant::now();
        poller.tick().await;
        assert_eq!(fixture.status.calls(), 3);
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }
}
