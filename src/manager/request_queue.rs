//! Durable per-broker FIFO of management requests.
//!
//! Requests that could not reach a broker (inactive, or the RPC failed) are
//! stored at `pending/{broker}/{seq:020}` in the object store. Zero-padded
//! sequence numbers make a lexicographic listing the FIFO order, and the
//! next sequence number is recovered from that listing the first time a
//! broker's queue is touched.
//!
//! Each broker's queue is guarded by its own async mutex. Replay holds it for
//! the whole pass, so a request enqueued during replay lands behind the ones
//! being delivered.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::PendingRequest;
use crate::error::{Error, Result};
use crate::metrics;
use crate::store::put_atomic;

const PENDING_PREFIX: &str = "pending";

#[derive(Default)]
struct BrokerQueue {
    loaded: bool,
    next_seq: u64,
    entries: BTreeMap<u64, PendingRequest>,
}

/// Result of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub delivered: usize,
    pub remaining: usize,
}

impl ReplayOutcome {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

pub struct PendingRequestQueue {
    object_store: Arc<dyn ObjectStore>,
    prefix: String,
    queues: DashMap<String, Arc<Mutex<BrokerQueue>>>,
}

impl PendingRequestQueue {
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self::with_prefix(object_store, PENDING_PREFIX)
    }

    pub fn with_prefix(object_store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            object_store,
            prefix: prefix.trim_end_matches('/').to_string(),
            queues: DashMap::new(),
        }
    }

    fn broker_dir(&self, broker: &str) -> String {
        format!("{}/{}", self.prefix, broker.replace([':', '/'], "_"))
    }

    fn entry_path(&self, broker: &str, seq: u64) -> ObjectPath {
        ObjectPath::from(format!("{}/{:020}", self.broker_dir(broker), seq))
    }

    fn queue(&self, broker: &str) -> Arc<Mutex<BrokerQueue>> {
        self.queues
            .entry(broker.to_string())
            .or_default()
            .clone()
    }

    async fn ensure_loaded(&self, broker: &str, queue: &mut BrokerQueue) -> Result<()> {
        if queue.loaded {
            return Ok(());
        }

        let dir = ObjectPath::from(self.broker_dir(broker));
        let metas: Vec<_> = self.object_store.list(Some(&dir)).try_collect().await?;

        for meta in metas {
            let Some(name) = meta.location.filename() else {
                continue;
            };
            let Ok(seq) = name.parse::<u64>() else {
                // Leftover temp object from an interrupted write.
                if let Err(e) = self.object_store.delete(&meta.location).await {
                    warn!(broker, path = %meta.location, error = %e, "Failed to delete leftover temp object");
                }
                continue;
            };
            let bytes = self.object_store.get(&meta.location).await?.bytes().await?;
            let request: PendingRequest = serde_json::from_slice(&bytes).map_err(|e| {
                Error::Storage(format!(
                    "corrupt pending request {}: {}",
                    meta.location, e
                ))
            })?;
            queue.entries.insert(seq, request);
        }

        queue.next_seq = queue
            .entries
            .keys()
            .next_back()
            .map(|seq| seq + 1)
            .unwrap_or(0);
        queue.loaded = true;

        if !queue.entries.is_empty() {
            info!(
                broker,
                pending = queue.entries.len(),
                next_seq = queue.next_seq,
                "Recovered pending requests"
            );
        }
        metrics::set_pending_requests(broker, queue.entries.len());
        Ok(())
    }

    /// Append `request` to the broker's queue and return its sequence number.
    pub async fn enqueue(&self, broker: &str, request: PendingRequest) -> Result<u64> {
        let queue = self.queue(broker);
        let mut queue = queue.lock().await;
        self.ensure_loaded(broker, &mut queue).await?;

        let seq = queue.next_seq;
        let data = serde_json::to_vec(&request)?;
        put_atomic(self.object_store.as_ref(), &self.entry_path(broker, seq), data).await?;

        queue.next_seq = seq + 1;
        debug!(broker, seq, request = request.name(), "Queued request for broker");
        queue.entries.insert(seq, request);
        metrics::set_pending_requests(broker, queue.entries.len());
        Ok(seq)
    }

    /// Queued requests, oldest first.
    pub async fn pending(&self, broker: &str) -> Result<Vec<(u64, PendingRequest)>> {
        let queue = self.queue(broker);
        let mut queue = queue.lock().await;
        self.ensure_loaded(broker, &mut queue).await?;
        Ok(queue
            .entries
            .iter()
            .map(|(seq, request)| (*seq, request.clone()))
            .collect())
    }

    /// Remove one delivered request. Acking an unknown sequence is a no-op.
    pub async fn ack(&self, broker: &str, seq: u64) -> Result<()> {
        let queue = self.queue(broker);
        let mut queue = queue.lock().await;
        self.ensure_loaded(broker, &mut queue).await?;
        self.remove_entry(broker, &mut queue, seq).await
    }

    async fn remove_entry(&self, broker: &str, queue: &mut BrokerQueue, seq: u64) -> Result<()> {
        if !queue.entries.contains_key(&seq) {
            return Ok(());
        }
        match self.object_store.delete(&self.entry_path(broker, seq)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(Error::from(e)),
        }
        queue.entries.remove(&seq);
        metrics::set_pending_requests(broker, queue.entries.len());
        Ok(())
    }

    /// Drop everything queued for `broker`; returns how many requests went.
    pub async fn purge(&self, broker: &str) -> Result<usize> {
        let handle = self.queue(broker);
        let mut queue = handle.lock().await;
        self.ensure_loaded(broker, &mut queue).await?;

        let seqs: Vec<u64> = queue.entries.keys().copied().collect();
        for seq in &seqs {
            self.remove_entry(broker, &mut queue, *seq).await?;
        }
        drop(queue);
        self.queues.remove(broker);

        if !seqs.is_empty() {
            info!(broker, purged = seqs.len(), "Purged pending requests");
        }
        Ok(seqs.len())
    }

    pub async fn len(&self, broker: &str) -> Result<usize> {
        let queue = self.queue(broker);
        let mut queue = queue.lock().await;
        self.ensure_loaded(broker, &mut queue).await?;
        Ok(queue.entries.len())
    }

    pub async fn is_empty(&self, broker: &str) -> Result<bool> {
        Ok(self.len(broker).await? == 0)
    }

    /// Deliver queued requests in order, acking each one after `deliver`
    /// succeeds. Stops at the first failure and keeps that request and
    /// everything behind it.
    pub async fn replay<F, Fut>(&self, broker: &str, mut deliver: F) -> Result<ReplayOutcome>
    where
        F: FnMut(PendingRequest) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let queue = self.queue(broker);
        let mut queue = queue.lock().await;
        self.ensure_loaded(broker, &mut queue).await?;

        let batch: Vec<(u64, PendingRequest)> = queue
            .entries
            .iter()
            .map(|(seq, request)| (*seq, request.clone()))
            .collect();

        let mut outcome = ReplayOutcome::default();
        for (seq, request) in batch {
            let name = request.name();
            if let Err(e) = deliver(request).await {
                warn!(broker, seq, request = name, error = %e, "Replay stopped at failed request");
                break;
            }
            self.remove_entry(broker, &mut queue, seq).await?;
            outcome.delivered += 1;
        }
        outcome.remaining = queue.entries.len();

        if outcome.delivered > 0 {
            info!(
                broker,
                delivered = outcome.delivered,
                remaining = outcome.remaining,
                "Replayed pending requests"
            );
        }
        Ok(outcome)
    }
}
