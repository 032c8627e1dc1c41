#![allow(dead_code)]

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use bigdecimal::BigDecimal;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use payment_reconciler::codec::{EncryptedCodec, PlainCodec, ProviderCodec, SignedCodec};
use payment_reconciler::db::{
    IdempotencyGuard, MemoryTransactionStore, PollCandidates, StatusUpdate, StoreError, StoreResult,
    TransactionStore,
};
use payment_reconciler::domain::{Provider, Transaction};
use payment_reconciler::middleware::request_logger::RequestLogSettings;
use payment_reconciler::services::{Broadcaster, Reconciler, SubscriberRegistry};
use payment_reconciler::{create_app, AppState};

pub const MERCHANT_KEY: &str = "gateway-a-merchant-key";
pub const WEBHOOK_SECRET: &str = "whsec_gateway_b";

pub struct TestApp {
    pub app: Router,
    pub store: Arc<MemoryTransactionStore>,
    pub registry: Arc<SubscriberRegistry>,
    pub reconciler: Reconciler,
    pub broadcaster: Broadcaster,
}

pub async fn test_app(live_heartbeat: Duration) -> TestApp {
    let store = Arc::new(MemoryTransactionStore::new());
    build_app(store.clone(), store, live_heartbeat)
}

/// Same app, but every status write fails as if the database went away.
/// `TestApp::store` still reads the underlying records.
pub async fn test_app_with_failing_writes(live_heartbeat: Duration) -> TestApp {
    let store = Arc::new(MemoryTransactionStore::new());
    build_app(
        Arc::new(WritesUnavailable(store.clone())),
        store,
        live_heartbeat,
    )
}

fn build_app(
    backend: Arc<dyn TransactionStore>,
    store: Arc<MemoryTransactionStore>,
    live_heartbeat: Duration,
) -> TestApp {
    let registry = Arc::new(SubscriberRegistry::new());
    let broadcaster = Broadcaster::start(registry.clone());
    let reconciler = Reconciler::new(
        backend.clone(),
        broadcaster.notifier(),
        IdempotencyGuard::NotTerminal,
    );

    let codecs: HashMap<Provider, ProviderCodec> = [
        ProviderCodec::GatewayA(EncryptedCodec::new(MERCHANT_KEY)),
        ProviderCodec::GatewayB(SignedCodec::new(WEBHOOK_SECRET)),
        ProviderCodec::GatewayC(PlainCodec),
    ]
    .into_iter()
    .map(|codec| (codec.provider(), codec))
    .collect();

    let app = create_app(AppState {
        store: backend,
        reconciler: reconciler.clone(),
        codecs: Arc::new(codecs),
        registry: registry.clone(),
        live_heartbeat,
        request_log: RequestLogSettings { log_body: true },
    });

    TestApp {
        app,
        store,
        registry,
        reconciler,
        broadcaster,
    }
}

pub struct WritesUnavailable(pub Arc<MemoryTransactionStore>);

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

pub async fn seed(store: &MemoryTransactionStore, order_id: &str, provider: Provider) -> Transaction {
    store
        .insert(&Transaction::new(
            order_id.to_string(),
            provider,
            BigDecimal::from(100),
            "INR".to_string(),
        ))
        .await
        .unwrap()
}

/// Wraps `plaintext` the way Gateway-A delivers it: AES-256-CBC with the
/// IV prepended, upper-case hex, inside a `{"body": ...}` envelope.
pub fn gateway_a_body(plaintext: &str) -> Vec<u8> {
    let iv = [3u8; 16];
    let key = Sha256::digest(MERCHANT_KEY.as_bytes());
    let mut ciphertext = iv.to_vec();
    ciphertext.extend(
        cbc::Encryptor::<Aes256>::new_from_slices(key.as_slice(), &iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes()),
    );
    serde_json::json!({ "body": hex::encode_upper(ciphertext) })
        .to_string()
        .into_bytes()
}

pub fn gateway_b_signature(body: &[u8]) -> String {
    SignedCodec::new(WEBHOOK_SECRET)
        .signature_for(body)
        .unwrap()
}

pub async fn post_webhook(
    app: &Router,
    provider: &str,
    body: Vec<u8>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{}", provider))
        .header("content-type", "application/json");
    for (name, value) in headers {
        request = request.header(*name, *value);
    }

    let response = app
        .clone()
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}
