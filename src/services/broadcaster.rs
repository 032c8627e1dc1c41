//! Live subscriber registry and the broadcaster task that feeds it.
//!
//! The reconciler never touches client connections. It sends a
//! [`LiveEvent`] through a [`Notifier`]; the broadcaster task fans it out
//! to every [`Subscription`] registered for that order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::domain::{Transaction, TransactionStatus};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveEventKind {
    Connected,
    PaymentCompleted,
    Heartbeat,
}

/// One NDJSON frame on a live order stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveEvent {
    #[serde(rename = "type")]
    pub kind: LiveEventKind,
    pub order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TransactionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LiveEvent {
    fn bare(kind: LiveEventKind, order_id: &str) -> Self {
        Self {
            kind,
            order_id: order_id.to_string(),
            status: None,
            provider_payment_id: None,
            settlement_reference: None,
            amount: None,
            currency: None,
            timestamp: Utc::now(),
        }
    }

    pub fn connected(order_id: &str) -> Self {
        Self::bare(LiveEventKind::Connected, order_id)
    }

    pub fn heartbeat(order_id: &str) -> Self {
        Self::bare(LiveEventKind::Heartbeat, order_id)
    }

    pub fn payment_completed(tx: &Transaction) -> Self {
        Self {
            kind: LiveEventKind::PaymentCompleted,
            order_id: tx.order_id.clone(),
            status: Some(tx.status),
            provider_payment_id: tx.provider_payment_id.clone(),
            settlement_reference: tx.settlement_reference.clone(),
            amount: Some(tx.amount.to_string()),
            currency: Some(tx.currency.clone()),
            timestamp: tx.updated_at,
        }
    }

    /// Serialized frame including the trailing newline.
    pub fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

type Streams = HashMap<String, HashMap<u64, mpsc::Sender<LiveEvent>>>;

/// Per-order sets of open live streams.
#[derive(Debug)]
pub struct SubscriberRegistry {
    streams: Mutex<Streams>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Streams> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(self: &Arc<Self>, order_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);

        let mut streams = self.lock();
        streams.entry(order_id.to_string()).or_default().insert(id, tx);
        let count = streams.get(order_id).map(HashMap::len).unwrap_or(0);
        drop(streams);

        tracing::debug!(order_id = %order_id, subscriber_id = id, subscribers = count, "Live subscriber registered");

        Subscription {
            id,
            order_id: order_id.to_string(),
            rx,
            registry: Arc::clone(self),
        }
    }

    pub fn unsubscribe(&self, order_id: &str, id: u64) {
        let mut streams = self.lock();
        if let Some(set) = streams.get_mut(order_id) {
            set.remove(&id);
            if set.is_empty() {
                streams.remove(order_id);
            }
        }
        tracing::debug!(order_id = %order_id, subscriber_id = id, "Live subscriber removed");
    }

    /// Delivers `event` to every stream registered for `order_id` without
    /// waiting on any of them. Returns how many streams accepted the frame.
    pub fn broadcast(&self, order_id: &str, event: &LiveEvent) -> usize {
        let mut streams = self.lock();
        let Some(set) = streams.get_mut(order_id) else {
            return 0;
        };

        let mut delivered = 0;
        set.retain(|id, sender| match sender.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(order_id = %order_id, subscriber_id = id, "Live subscriber queue full, dropping frame");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if set.is_empty() {
            streams.remove(order_id);
        }
        delivered
    }

    /// Drops every registered stream so open live responses end. Used at
    /// shutdown. Returns how many streams were closed.
    pub fn close_all(&self) -> usize {
        let mut streams = self.lock();
        let closed = streams.values().map(HashMap::len).sum();
        streams.clear();
        closed
    }

    pub fn subscriber_count(&self, order_id: &str) -> usize {
        self.lock().get(order_id).map(HashMap::len).unwrap_or(0)
    }

    pub fn order_count(&self) -> usize {
        self.lock().len()
    }
}

/// A registered live stream. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    order_id: String,
    rx: mpsc::Receiver<LiveEvent>,
    registry: Arc<SubscriberRegistry>,
}

impl Subscription {
    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    pub async fn recv(&mut self) -> Option<LiveEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.order_id, self.id);
    }
}

/// Message-passing handle the reconciler uses to request a broadcast.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<LiveEvent>,
}

impl Notifier {
    /// A notifier with no broadcaster behind it; the receiver sees every
    /// notification.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<LiveEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn notify(&self, event: LiveEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Broadcaster is stopped, dropping live notification");
        }
    }
}

pub struct Broadcaster {
    notifier: Notifier,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Broadcaster {
    pub fn start(registry: Arc<SubscriberRegistry>) -> Self {
        let (notifier, mut rx) = Notifier::detached();
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            tracing::info!("Broadcaster started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            let delivered = registry.broadcast(&event.order_id, &event);
                            tracing::info!(
                                order_id = %event.order_id,
                                delivered,
                                "Live notification broadcast"
                            );
                        }
                        None => break,
                    },
                }
            }
            tracing::info!("Broadcaster stopped");
        });

        Self {
            notifier,
            shutdown,
            handle,
        }
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::error!("Broadcaster task failed: {}", e);
        }
    }
}
