//! The storage-wiggler priority engine.
//!
//! A wiggle is the rolling replacement of a storage server with a fresh one,
//! to refresh hardware or correct misconfiguration. The wiggler keeps a
//! priority queue of candidate servers ordered by [`StorageMetadata`]:
//! wrongly-configured servers first, then least-recently-created. A side
//! index from server id to queue key gives O(log n) removal and in-place
//! metadata updates.
//!
//! Round and per-wiggle statistics are persisted through the metadata store
//! so a restarted distributor resumes counting where its predecessor
//! stopped; `start_wiggle`/`finish_wiggle` are idempotent with respect to
//! duplicate invocations within one round, as detected by the
//! round-transition predicates over the stored timestamps.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::error::DistributionResult;
use super::txn_processor::TxnProcessor;
use crate::constants::WIGGLE_MIN_ON_CHECK_DELAY;
use crate::types::{ServerId, StorageMetadata};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Externally visible wiggler phase, reported through the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WigglerPhase {
    Invalid,
    Run,
    Pause,
}

/// Persisted wiggle round statistics for one region role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WiggleMetrics {
    pub last_round_start_ms: u64,
    pub last_round_finish_ms: u64,
    pub last_wiggle_start_ms: u64,
    pub last_wiggle_finish_ms: u64,
    pub finished_wiggle: u64,
    pub finished_round: u64,
    pub smoothed_wiggle_duration_ms: f64,
    pub smoothed_round_duration_ms: f64,
}

impl WiggleMetrics {
    /// A new round starts when the previous one has been closed out.
    pub fn should_start_new_round(&self) -> bool {
        self.last_round_finish_ms >= self.last_round_start_ms
    }
}

/// Priority queue of storage servers eligible for rolling replacement.
pub struct StorageWiggler {
    primary: bool,
    queue: BTreeSet<(StorageMetadata, ServerId)>,
    handles: HashMap<ServerId, StorageMetadata>,
    metrics: WiggleMetrics,
    min_ss_age_ms: u64,
    phase: WigglerPhase,
    last_phase_change_ms: u64,
}

impl StorageWiggler {
    pub fn new(primary: bool, min_ss_age: std::time::Duration) -> Self {
        Self {
            primary,
            queue: BTreeSet::new(),
            handles: HashMap::new(),
            metrics: WiggleMetrics::default(),
            min_ss_age_ms: min_ss_age.as_millis() as u64,
            phase: WigglerPhase::Invalid,
            last_phase_change_ms: now_ms(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.handles.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Add a server to the wiggle queue. The server must not already be
    /// queued.
    pub fn add_server(&mut self, id: ServerId, metadata: StorageMetadata) {
        assert!(
            !self.handles.contains_key(&id),
            "server {id} is already in the wiggle queue"
        );
        self.handles.insert(id, metadata);
        self.queue.insert((metadata, id));
    }

    /// Remove a server. No-op if the server was already popped or never
    /// added.
    pub fn remove_server(&mut self, id: &ServerId) {
        if let Some(metadata) = self.handles.remove(id) {
            self.queue.remove(&(metadata, *id));
        }
    }

    /// Reorder a queued server after its metadata changed. No-op when the
    /// metadata is unchanged.
    pub fn update_metadata(&mut self, id: ServerId, metadata: StorageMetadata) {
        let Some(current) = self.handles.get(&id).copied() else {
            return;
        };
        if current == metadata {
            return;
        }
        self.queue.remove(&(current, id));
        self.queue.insert((metadata, id));
        self.handles.insert(id, metadata);
    }

    /// Whether wiggling this server is necessary rather than merely
    /// possible: it is misconfigured, or old enough for a routine refresh.
    pub fn necessary(&self, metadata: &StorageMetadata) -> bool {
        metadata.wrong_configured
            || now_ms().saturating_sub(metadata.created_at_ms) > self.min_ss_age_ms
    }

    /// Pop the highest-priority server. With `necessary_only`, returns
    /// `None` without popping when the top of the queue is not necessary.
    pub fn next_server_id(&mut self, necessary_only: bool) -> Option<ServerId> {
        let (metadata, id) = *self.queue.iter().next()?;
        if necessary_only && !self.necessary(&metadata) {
            return None;
        }
        self.queue.remove(&(metadata, id));
        self.handles.remove(&id);
        Some(id)
    }

    /// Delay between eligibility checks when the queue yields nothing.
    pub async fn on_check(&self) {
        tokio::time::sleep(WIGGLE_MIN_ON_CHECK_DELAY).await;
    }

    pub fn metrics(&self) -> &WiggleMetrics {
        &self.metrics
    }

    pub fn phase(&self) -> WigglerPhase {
        self.phase
    }

    pub fn last_phase_change_ms(&self) -> u64 {
        self.last_phase_change_ms
    }

    pub fn set_phase(&mut self, phase: WigglerPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.last_phase_change_ms = now_ms();
        }
    }

    /// A round finishes once every queued candidate has been wiggled.
    pub fn should_finish_round(&self) -> bool {
        self.queue.is_empty()
    }

    /// Restore persisted round statistics.
    pub async fn restore_stats(&mut self, txn: &Arc<dyn TxnProcessor>) -> DistributionResult<()> {
        if let Some(metrics) = txn.read_storage_wiggle_metrics(self.primary).await? {
            self.metrics = metrics;
        }
        Ok(())
    }

    /// Zero out and persist round statistics.
    pub async fn reset_stats(&mut self, txn: &Arc<dyn TxnProcessor>) -> DistributionResult<()> {
        self.metrics = WiggleMetrics::default();
        txn.update_storage_wiggle_metrics(self.primary, &self.metrics)
            .await
    }

    /// Record the start of one server's wiggle, opening a new round if the
    /// previous one was closed. Duplicate invocations within one round only
    /// move the per-wiggle timestamp.
    pub async fn start_wiggle(&mut self, txn: &Arc<dyn TxnProcessor>) -> DistributionResult<()> {
        self.metrics.last_wiggle_start_ms = now_ms();
        if self.metrics.should_start_new_round() {
            self.metrics.last_round_start_ms = self.metrics.last_wiggle_start_ms;
        }
        txn.update_storage_wiggle_metrics(self.primary, &self.metrics)
            .await
    }

    /// Record the completion of one server's wiggle, closing the round when
    /// the queue has drained.
    pub async fn finish_wiggle(&mut self, txn: &Arc<dyn TxnProcessor>) -> DistributionResult<()> {
        self.metrics.last_wiggle_finish_ms = now_ms();
        self.metrics.finished_wiggle += 1;
        let duration = self
            .metrics
            .last_wiggle_finish_ms
            .saturating_sub(self.metrics.last_wiggle_start_ms) as f64;
        self.metrics.smoothed_wiggle_duration_ms =
            smooth(self.metrics.smoothed_wiggle_duration_ms, duration);

        if self.should_finish_round() {
            self.metrics.last_round_finish_ms = self.metrics.last_wiggle_finish_ms;
            self.metrics.finished_round += 1;
            let round_duration = self
                .metrics
                .last_round_finish_ms
                .saturating_sub(self.metrics.last_round_start_ms) as f64;
            self.metrics.smoothed_round_duration_ms =
                smooth(self.metrics.smoothed_round_duration_ms, round_duration);
        }
        txn.update_storage_wiggle_metrics(self.primary, &self.metrics)
            .await
    }
}

/// Exponential blend toward the latest sample, smoothing over rounds.
fn smooth(current: f64, sample: f64) -> f64 {
    if current == 0.0 {
        sample
    } else {
        0.9 * current + 0.1 * sample
    }
}
