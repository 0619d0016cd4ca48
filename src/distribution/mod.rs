//! The data-distribution control core.
//!
//! This module owns the bootstrap state machine, the relocation pipeline that
//! funnels work between the shard tracker, the relocation queue, and the team
//! collections, the storage-wiggler priority engine, the audit supervisor,
//! and the cluster-snapshot orchestrator.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────────┐
//!                      │  Admin requests  │
//!                      └────────┬─────────┘
//!                               ▼
//!                      ┌──────────────────┐
//!                      │  RPC dispatcher  │  snap dedup, halt, metrics
//!                      └────────┬─────────┘
//!                               │
//!   ┌───────────────────────────┼────────────────────────────┐
//!   ▼                           ▼                            ▼
//! ┌──────────────┐    ┌───────────────────┐    ┌──────────────────────┐
//! │ Audit        │    │ DataDistributor   │    │ Snapshot             │
//! │ supervisor   │    │ bootstrap + main  │    │ orchestrator         │
//! └──────┬───────┘    │ supervision loop  │    └──────────┬───────────┘
//!        │            └─────────┬─────────┘               │
//!        │                      │ RelocateShard           │
//!        ▼                      ▼                         ▼
//! ┌──────────────┐    ┌───────────────────┐    ┌──────────────────────┐
//! │ TxnProcessor │    │ yielding bridge → │    │ SnapshotTransport    │
//! │ (fenced      │    │ relocation queue  │    │ (tlogs, workers,     │
//! │  metadata)   │    │ (external)        │    │  coordinators)       │
//! └──────────────┘    └───────────────────┘    └──────────────────────┘
//! ```
//!
//! All mutable core state (the shard map, the audit table, the wiggle queue)
//! is owned by one [`DataDistributor`] incarnation; tasks suspend only at
//! metadata round-trips, stream operations, and explicit yields, so no state
//! is observed mid-mutation. The move-keys lock fences every persisted
//! mutation against a newer incarnation.

pub mod audit;
mod config;
pub mod distributor;
mod enabled_state;
mod error;
pub mod external;
mod initial_snapshot;
pub mod metrics;
pub mod physical_shards;
pub mod relocation;
pub mod retry;
pub mod rpc;
pub mod shard_map;
pub mod snapshot;
pub mod tasks;
mod txn_processor;
pub mod wiggler;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock_txn;

pub use audit::{AuditPhase, AuditRequest, AuditState, AuditType, DdAudit};
pub use config::{DatabaseConfiguration, DistributorConfig, RegionInfo, UserRangeConfig};
pub use distributor::{DataDistributor, DataDistributorBuilder};
pub use enabled_state::DdEnabledState;
pub use error::{DistributionError, DistributionResult};
pub use external::{
    ComponentFactory, QueueParams, ShardMetricsRequest, SnapshotTransport, StatefulWorker,
    StatefulWorkers, StorageAuditClient, TeamCollection, TeamCollectionParams, TenantCache,
    TrackerParams, WigglerStateSnapshot, WorkerRoles,
};
pub use initial_snapshot::{
    DataMove, DataMoveMeta, DistributionMode, InitialDataDistribution, ShardInfo,
};
pub use physical_shards::PhysicalShardCollection;
pub use relocation::{RelocateReason, RelocateShard, RelocationProducer, relocation_pipeline};
pub use rpc::{
    BlobRestoreOutcome, DistributorRequest, ExclusionSafetyReply, MetricsReply,
    PrepareBlobRestoreRequest, WigglerStateReply,
};
pub use shard_map::ShardTeamMap;
pub use snapshot::{SnapshotRequest, wait_for_most};
pub use tasks::{ReadySignal, TaskGroup};
pub use txn_processor::{MoveKeysLock, TxnProcessor};
pub use wiggler::{StorageWiggler, WiggleMetrics, WigglerPhase};

#[cfg(any(test, feature = "test-utilities"))]
pub use mock_txn::{
    MockComponentFactory, MockSnapshotTransport, MockStorageAuditClient, MockTeamCollection,
    MockTenantCache, MockTxnProcessor,
};
