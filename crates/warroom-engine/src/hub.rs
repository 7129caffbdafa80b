use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use warroom_core::events::BroadcastEvent;
use warroom_core::ids::ObserverId;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport write failed: {0}")]
    Write(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A live push transport. Implemented by the WebSocket layer and by test doubles.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    fn close(&self);
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Per-observer queue depth. A full queue counts as a failed delivery.
    pub queue_capacity: usize,
    pub send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of a single publish pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
    pub pruned: usize,
}

struct ObserverHandle {
    tx: mpsc::Sender<Bytes>,
    observer: Arc<dyn Observer>,
    worker: JoinHandle<()>,
}

/// Fan-out of broadcast events to every registered observer.
///
/// Each observer owns a bounded FIFO queue drained by its own delivery
/// worker, so a slow transport never stalls `publish` or its peers.
pub struct BroadcastHub {
    observers: DashMap<ObserverId, ObserverHandle>,
    config: HubConfig,
    this: Weak<BroadcastHub>,
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            observers: DashMap::new(),
            config,
            this: this.clone(),
        })
    }

    /// Must be called from within a Tokio runtime.
    pub fn register_observer(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = ObserverId::new();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let worker = tokio::spawn(deliver(
            self.this.clone(),
            id.clone(),
            Arc::clone(&observer),
            rx,
            self.config.send_timeout,
        ));
        self.observers.insert(
            id.clone(),
            ObserverHandle {
                tx,
                observer,
                worker,
            },
        );
        tracing::debug!(observer_id = %id, observers = self.observers.len(), "observer registered");
        id
    }

    /// Drop the observer's queue and close its transport. Returns false if
    /// it was already gone.
    pub fn remove_observer(&self, id: &ObserverId) -> bool {
        match self.observers.remove(id) {
            Some((_, handle)) => {
                handle.observer.close();
                handle.worker.abort();
                tracing::debug!(observer_id = %id, "observer removed");
                true
            }
            None => false,
        }
    }

    /// Enqueue one serialized copy of `event` for every live observer.
    /// Never awaits.
    pub fn publish(&self, event: &BroadcastEvent) -> Result<PublishReport, HubError> {
        let closed: Vec<ObserverId> = self
            .observers
            .iter()
            .filter(|entry| !entry.value().observer.is_open())
            .map(|entry| entry.key().clone())
            .collect();
        for id in &closed {
            let _ = self.remove_observer(id);
        }

        let payload = Bytes::from(serde_json::to_vec(event)?);

        let mut delivered = 0;
        let mut failed = Vec::new();
        for entry in self.observers.iter() {
            match entry.value().tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(observer_id = %entry.key(), "observer queue full, dropping observer");
                    failed.push(entry.key().clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => failed.push(entry.key().clone()),
            }
        }
        for id in &failed {
            let _ = self.remove_observer(id);
        }

        tracing::trace!(
            event_type = event.event_type(),
            delivered,
            failed = failed.len(),
            pruned = closed.len(),
            "event published"
        );
        Ok(PublishReport {
            delivered,
            failed: failed.len(),
            pruned: closed.len(),
        })
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn contains(&self, id: &ObserverId) -> bool {
        self.observers.contains_key(id)
    }

    /// Remove and close every observer.
    pub fn close_all(&self) {
        let ids: Vec<ObserverId> = self.observers.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            let _ = self.remove_observer(id);
        }
    }
}

async fn deliver(
    hub: Weak<BroadcastHub>,
    id: ObserverId,
    observer: Arc<dyn Observer>,
    mut rx: mpsc::Receiver<Bytes>,
    send_timeout: Duration,
) {
    while let Some(payload) = rx.recv().await {
        match tokio::time::timeout(send_timeout, observer.send(payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::info!(observer_id = %id, error = %e, "observer write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(observer_id = %id, timeout_ms = send_timeout.as_millis() as u64, "observer write timed out");
                break;
            }
        }
    }
    match hub.upgrade() {
        Some(hub) => {
            let _ = hub.remove_observer(&id);
        }
        None => observer.close(),
    }
}
