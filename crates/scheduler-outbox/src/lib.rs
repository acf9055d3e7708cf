//! Transactional outbox relay.
//!
//! `scheduler-core` appends a [`HistoryEntry`] to the Store in the same
//! transaction as every state change it makes, but never calls out to an
//! external system itself — that would put a network round-trip inside the
//! hot dispatch path. This crate closes the gap: [`OutboxRelay`] polls
//! [`Store::unrelayed_history`], hands each row to a [`RelaySink`], and marks
//! it relayed only after the sink accepts it. A crash between relay and the
//! mark leads to an at-least-once redelivery, never a loss.
//!
//! [`HistoryEntry`]: scheduler_core::model::HistoryEntry
//! [`Store::unrelayed_history`]: scheduler_core::store::Store::unrelayed_history

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::model::HistoryEntry;
use scheduler_core::store::Store;
use tokio_util::sync::CancellationToken;

/// Destination for relayed history rows: a webhook forwarder, a message bus
/// publisher, a metrics pipeline. Failure is expected and not fatal to the
/// relay loop — the row simply stays unrelayed and is retried next tick.
#[async_trait]
pub trait RelaySink: Send + Sync {
    async fn relay(&self, entry: &HistoryEntry) -> anyhow::Result<()>;
}

/// Sink that logs each entry via `tracing` and never fails. Useful as a
/// baseline relay target and in tests.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl RelaySink for TracingSink {
    async fn relay(&self, entry: &HistoryEntry) -> anyhow::Result<()> {
        tracing::info!(
            actor = %entry.actor,
            kind = %entry.event_kind,
            job_id = ?entry.job_id,
            worker_id = ?entry.worker_id,
            "relayed history entry"
        );
        Ok(())
    }
}

/// Polls a [`Store`] for unrelayed history and drains it to a [`RelaySink`].
pub struct OutboxRelay<S: Store, K: RelaySink> {
    store: Arc<S>,
    sink: Arc<K>,
    batch_size: usize,
    poll_interval: Duration,
    relayed_count: AtomicU64,
    failure_count: AtomicU64,
}

impl<S: Store, K: RelaySink> OutboxRelay<S, K> {
    pub fn new(store: Arc<S>, sink: Arc<K>, poll_interval: Duration) -> Self {
        Self {
            store,
            sink,
            batch_size: 100,
            poll_interval,
            relayed_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Drains at most one batch of unrelayed history. Returns the number of
    /// rows successfully relayed and marked. A sink failure on one row stops
    /// the batch at that row — later rows in the same batch are left for the
    /// next poll rather than relayed out of order.
    pub async fn drain_once(&self) -> usize {
        let rows = match self.store.unrelayed_history(self.batch_size).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read unrelayed history");
                return 0;
            }
        };

        let mut relayed = 0;
        for (sequence, entry) in rows {
            match self.sink.relay(&entry).await {
                Ok(()) => {
                    if let Err(err) = self.store.mark_history_relayed(sequence).await {
                        tracing::warn!(sequence, error = %err, "failed to mark history row relayed");
                        break;
                    }
                    self.relayed_count.fetch_add(1, Ordering::Relaxed);
                    relayed += 1;
                }
                Err(err) => {
                    self.failure_count.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(sequence, error = %err, "outbox sink rejected history row, will retry");
                    break;
                }
            }
        }
        relayed
    }

    /// Runs until `cancel` fires, polling at `poll_interval`.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            self.drain_once().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    pub fn relayed_count(&self) -> u64 {
        self.relayed_count.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }
}
