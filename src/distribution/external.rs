//! Trait seams for the distributor's external collaborators.
//!
//! The control core is deliberately thin at its edges: the per-shard
//! size-and-traffic tracker, the relocation scheduler, the team formation
//! engine, the tenant cache, and the storage-server RPC layer are all
//! consumed through the traits in this module. Production wires real
//! components; tests wire the mocks in [`mock_txn`](super::mock_txn).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, RwLock};

use super::audit::{AuditRequest, AuditState};
use super::error::DistributionResult;
use super::initial_snapshot::InitialDataDistribution;
use super::physical_shards::PhysicalShardCollection;
use super::relocation::{RelocateShard, RelocationProducer};
use super::shard_map::ShardTeamMap;
use super::tasks::ReadySignal;
use super::txn_processor::MoveKeysLock;
use super::wiggler::WigglerPhase;
use crate::types::{
    DcId, DistributorId, KeyRange, ServerId, ShardMetric, SnapshotId, TenantName,
};

/// A request for shard size metrics, answered by the shard tracker.
#[derive(Debug)]
pub struct ShardMetricsRequest {
    pub keys: KeyRange,
    pub shard_limit: usize,
    pub reply: oneshot::Sender<Vec<ShardMetric>>,
}

/// Construction parameters for one team collection.
pub struct TeamCollectionParams {
    pub distributor_id: DistributorId,
    pub lock: MoveKeysLock,
    pub primary: bool,
    pub dc_ids: Vec<DcId>,
    /// Fires once the initial shards are tracked.
    pub ready: ReadySignal,
    /// Set true while the region has zero healthy teams.
    pub zero_healthy_teams: watch::Sender<bool>,
    pub output: RelocationProducer,
    pub shard_map: Arc<RwLock<ShardTeamMap>>,
    /// Resolved by the collection when a failed server must be dropped from
    /// the keyspace; the supervision loop finishes the removal.
    pub remove_failed_server: watch::Sender<Option<ServerId>>,
}

/// Construction parameters for the shard tracker.
pub struct TrackerParams {
    pub distributor_id: DistributorId,
    pub init_data: Arc<InitialDataDistribution>,
    pub output: RelocationProducer,
    pub shard_map: Arc<RwLock<ShardTeamMap>>,
    pub physical_shards: Arc<RwLock<PhysicalShardCollection>>,
    /// Fired by the tracker once all initial shards are tracked.
    pub ready: ReadySignal,
    /// True while any region has zero healthy teams.
    pub any_zero_healthy_teams: watch::Receiver<bool>,
    pub metrics_requests: mpsc::UnboundedReceiver<ShardMetricsRequest>,
}

/// Construction parameters for the relocation queue.
pub struct QueueParams {
    pub distributor_id: DistributorId,
    pub lock: MoveKeysLock,
    /// Bounded consumer side of the relocation pipeline.
    pub relocations: mpsc::Receiver<RelocateShard>,
    /// Total replicas per shard across regions.
    pub team_size: usize,
    pub single_region_team_size: usize,
    pub shard_map: Arc<RwLock<ShardTeamMap>>,
}

/// Snapshot of one wiggler's externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WigglerStateSnapshot {
    pub phase: WigglerPhase,
    pub last_state_change_ms: u64,
}

/// The per-region team formation engine.
#[async_trait]
pub trait TeamCollection: Send + Sync {
    fn is_primary(&self) -> bool;

    /// Run the collection until cancelled or a graph error occurs.
    async fn run(&self) -> DistributionResult<()>;

    /// Number of teams currently built.
    async fn team_count(&self) -> usize;

    /// A random healthy team not containing `excluding`, as a server list.
    async fn random_healthy_team(&self, excluding: ServerId) -> Vec<ServerId>;

    /// Whether excluding the given servers leaves the region serviceable.
    async fn exclusion_safety_check(&self, exclude: &[ServerId]) -> bool;

    /// Externally visible wiggler state for this region.
    async fn wiggler_state(&self) -> WigglerStateSnapshot;
}

/// The per-shard size-and-traffic tracker and the relocation scheduler,
/// built per supervision round by the embedder.
#[async_trait]
pub trait ComponentFactory: Send + Sync {
    async fn build_team_collection(
        &self,
        params: TeamCollectionParams,
    ) -> DistributionResult<Arc<dyn TeamCollection>>;

    /// Run the shard tracker until cancelled or a graph error occurs. The
    /// tracker must fire `params.ready` once all initial shards are tracked.
    async fn run_tracker(&self, params: TrackerParams) -> DistributionResult<()>;

    /// Run the relocation queue until cancelled or a graph error occurs.
    async fn run_queue(&self, params: QueueParams) -> DistributionResult<()>;

    /// The tenant cache, when tenant awareness or storage quotas are on.
    fn tenant_cache(&self) -> Option<Arc<dyn TenantCache>>;
}

/// Tenant storage-quota bookkeeping.
#[async_trait]
pub trait TenantCache: Send + Sync {
    /// Keep the tenant map current until cancelled.
    async fn monitor(&self) -> DistributionResult<()>;

    /// Tenants currently over their storage quota.
    async fn tenants_over_quota(&self) -> Vec<TenantName>;
}

/// The storage-server audit RPC.
#[async_trait]
pub trait StorageAuditClient: Send + Sync {
    /// Ask one storage server to audit a range, possibly against the given
    /// comparison targets. Returns the resulting per-range state.
    async fn audit_storage(
        &self,
        server: ServerId,
        request: AuditRequest,
    ) -> DistributionResult<AuditState>;
}

/// Role assignment of one stateful worker, as discovered for a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerRoles {
    pub storage: bool,
    pub tlog: bool,
    pub coordinator: bool,
}

/// One stateful worker participating in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatefulWorker {
    pub id: ServerId,
    pub roles: WorkerRoles,
}

/// The set of stateful workers plus the count of storage servers that could
/// not be resolved to a worker (they consume fault-tolerance budget).
#[derive(Debug, Clone, Default)]
pub struct StatefulWorkers {
    pub workers: Vec<StatefulWorker>,
    pub storage_failures: usize,
}

impl StatefulWorkers {
    pub fn storages(&self) -> impl Iterator<Item = &StatefulWorker> {
        self.workers.iter().filter(|w| w.roles.storage)
    }

    pub fn tlogs(&self) -> impl Iterator<Item = &StatefulWorker> {
        self.workers.iter().filter(|w| w.roles.tlog)
    }

    pub fn coordinators(&self) -> impl Iterator<Item = &StatefulWorker> {
        self.workers.iter().filter(|w| w.roles.coordinator)
    }
}

/// RPC surface used by the snapshot orchestrator.
#[async_trait]
pub trait SnapshotTransport: Send + Sync {
    /// The local transaction logs.
    async fn local_tlogs(&self) -> DistributionResult<Vec<ServerId>>;

    /// Stop the given tlog from popping its queue until re-enabled.
    async fn disable_tlog_pop(
        &self,
        tlog: ServerId,
        snap_id: SnapshotId,
    ) -> DistributionResult<()>;

    /// Re-enable popping on the given tlog.
    async fn enable_tlog_pop(
        &self,
        tlog: ServerId,
        snap_id: SnapshotId,
    ) -> DistributionResult<()>;

    /// Enumerate stateful workers (storages, tlogs, coordinators).
    async fn stateful_workers(&self) -> DistributionResult<StatefulWorkers>;

    /// Ask one worker to take its part of the snapshot. Duplicate deliveries
    /// with the same snapshot id must be idempotent on the receiver.
    async fn snap_worker(
        &self,
        worker: ServerId,
        payload: &Bytes,
        snap_id: SnapshotId,
        role: &str,
    ) -> DistributionResult<()>;
}
