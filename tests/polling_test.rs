mod common;

use axum::http::StatusCode;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use payment_reconciler::clock::SystemClock;
use payment_reconciler::codec::{PlainCodec, ProviderCodec};
use payment_reconciler::db::TransactionStore;
use payment_reconciler::domain::{Provider, TransactionStatus};
use payment_reconciler::providers::HttpStatusClient;
use payment_reconciler::services::{LiveEventKind, PollingConfig, ProviderPoller};

use common::{post_webhook, seed, test_app, TestApp};

fn gateway_c_poller(t: &TestApp, base_url: String) -> ProviderPoller {
    ProviderPoller::new(
        Arc::new(HttpStatusClient::new(
            ProviderCodec::GatewayC(PlainCodec),
            base_url,
            Some("test-api-key".to_string()),
        )),
        t.store.clone(),
        t.reconciler.clone(),
        Arc::new(SystemClock),
        PollingConfig {
            call_delay: Duration::ZERO,
            ..PollingConfig::default()
        },
    )
}

#[tokio::test]
async fn test_repeated_permission_denial_disables_polling() {
    let mut server = mockito::Server::new_async().await;
    let denied = server
        .mock("GET", "/api/orders/ORD_3/status")
        .match_header("x-api-key", "test-api-key")
        .with_status(403)
        .with_header("content-type", "application/json")
        .with_body(json!({"code": "PERMISSION_DENIED"}).to_string())
        .expect(3)
        .create_async()
        .await;

    let t = test_app(Duration::from_secs(3600)).await;
    seed(&t.store, "ORD_3", Provider::GatewayC).await;
    let mut poller = gateway_c_poller(&t, server.url());

    for _ in 0..2 {
        let report = poller.tick().await;
        assert_eq!(report.denied, 1);
        assert_eq!(report.disabled, 0);
    }
    let report = poller.tick().await;
    assert_eq!(report.disabled, 1);

    let tx = t.store.find_by_order_id("ORD_3").await.unwrap().unwrap();
    assert!(tx.polling_disabled);
    assert_eq!(tx.status, TransactionStatus::Pending);

    let report = poller.tick().await;
    assert_eq!(report.candidates, 0);
    denied.assert_async().await;

    // Webhooks still reconcile a polling-disabled order.
    let body = json!({"orderId": "ORD_3", "status": "COMPLETED", "utr": "UTR3"})
        .to_string()
        .into_bytes();
    let (status, ack) = post_webhook(&t.app, "gateway-c", body, &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "applied");
}

#[tokio::test]
async fn test_pending_poll_answer_leaves_record_unchanged() {
    let mut server = mockito::Server::new_async().await;
    let _pending = server
        .mock("GET", "/api/orders/ORD_2/status")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"orderId": "ORD_2", "status": "PENDING"}).to_string())
        .create_async()
        .await;

    let t = test_app(Duration::from_secs(3600)).await;
    let before = seed(&t.store, "ORD_2", Provider::GatewayC).await;
    let mut poller = gateway_c_poller(&t, server.url());

    let report = poller.tick().await;
    assert_eq!(report.candidates, 1);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.applied, 0);

    let after = t.store.find_by_order_id("ORD_2").await.unwrap().unwrap();
    assert_eq!(after.status, TransactionStatus::Pending);
    assert!(after.audit_trail.is_empty());
    assert_eq!(after.updated_at, before.updated_at);
}

#[tokio::test]
async fn test_poll_completion_reaches_live_subscriber() {
    let mut server = mockito::Server::new_async().await;
    let _completed = server
        .mock("GET", "/api/orders/ORD_P/status")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "orderId": "ORD_P",
                "status": "SUCCESS",
                "utr": "UTR777",
                "transactionId": "c-77",
                "amount": "100.00"
            })
            .to_string(),
        )
        .create_async()
        .await;

    let t = test_app(Duration::from_secs(3600)).await;
    seed(&t.store, "ORD_P", Provider::GatewayC).await;
    let mut watcher = t.registry.subscribe("ORD_P");
    let mut poller = gateway_c_poller(&t, server.url());

    let report = poller.tick().await;
    assert_eq!(report.applied, 1);

    let event = tokio::time::timeout(Duration::from_secs(1), watcher.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, LiveEventKind::PaymentCompleted);
    assert_eq!(event.settlement_reference.as_deref(), Some("UTR777"));

    let tx = t.store.find_by_order_id("ORD_P").await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert!(!tx.audit_trail[0].amount_mismatch);

    // Completed orders leave the candidate set.
    assert_eq!(poller.tick().await.candidates, 0);
}

#[tokio::test]
async fn test_upstream_errors_do_not_change_state() {
    let mut server = mockito::Server::new_async().await;
    let _broken = server
        .mock("GET", "/api/orders/ORD_E/status")
        .with_status(502)
        .create_async()
        .await;

    let t = test_app(Duration::from_secs(3600)).await;
    seed(&t.store, "ORD_E", Provider::GatewayC).await;
    let mut poller = gateway_c_poller(&t, server.url());

    let report = poller.tick().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.denied, 0);

    let tx = t.store.find_by_order_id("ORD_E").await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert!(!tx.polling_disabled);
}
