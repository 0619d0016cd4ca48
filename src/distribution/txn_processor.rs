//! The transactional metadata store seam.
//!
//! Every persistent read or write the control core performs goes through
//! [`TxnProcessor`]. Implementations run each call as one transaction against
//! the cluster's metadata keyspace; calls that mutate shard, move, audit, or
//! wiggle state must revalidate the presented [`MoveKeysLock`] inside the
//! transaction and fail with
//! [`DistributionError::MoveKeysConflict`](super::DistributionError::MoveKeysConflict)
//! if a newer distributor has taken it.
//!
//! The in-memory implementation used by tests lives in
//! [`mock_txn`](super::mock_txn).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::audit::{AuditState, AuditType};
use super::config::DatabaseConfiguration;
use super::error::DistributionResult;
use super::initial_snapshot::InitialDataDistribution;
use super::wiggler::WiggleMetrics;
use crate::types::{
    AuditId, DataMoveId, DcId, DistributorId, KeyRange, RangeLocations, ServerId,
    StorageServerInfo,
};

/// The cluster-wide fence token every distributor holds to perform metadata
/// mutations. Taking the lock publishes the new owner and fences out any
/// prior incarnation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveKeysLock {
    /// Owner recorded by the previous holder.
    pub prev_owner: Uuid,
    /// Write stamp of the previous holder.
    pub prev_write: Uuid,
    /// This incarnation's identity.
    pub my_owner: Uuid,
}

/// All persistent reads and writes against the cluster's metadata keyspace.
///
/// # Contract
///
/// Each method either succeeds transactionally against the fenced lock or
/// returns a well-defined error (`MoveKeysConflict`, `ConfigChanged`,
/// `NotImplemented`, `Txn(..)`). Implementations retry transient transaction
/// conflicts internally; the errors listed above are terminal for the call.
#[async_trait]
pub trait TxnProcessor: Send + Sync {
    /// Take the move-keys lock, fencing out the previous holder.
    async fn take_move_keys_lock(&self, dd_id: DistributorId)
        -> DistributionResult<MoveKeysLock>;

    /// Watch the move-keys lock; resolves with `MoveKeysConflict` when a
    /// newer distributor takes it. Does not resolve otherwise.
    async fn poll_move_keys_lock(&self, lock: MoveKeysLock) -> DistributionResult<()>;

    /// Load the replication configuration.
    async fn get_database_configuration(&self) -> DistributionResult<DatabaseConfiguration>;

    /// Publish the current primary/remote DC mapping so the cluster's other
    /// services see it.
    async fn update_replica_keys(
        &self,
        primary_dc_ids: &[DcId],
        remote_dc_ids: &[DcId],
        configuration: &DatabaseConfiguration,
    ) -> DistributionResult<()>;

    /// Atomic snapshot of all shards, data moves, and audit states as of one
    /// read version.
    async fn get_initial_data_distribution(
        &self,
        dd_id: DistributorId,
        lock: MoveKeysLock,
        remote_dc_ids: &[DcId],
    ) -> DistributionResult<InitialDataDistribution>;

    /// Resolve once the operator has enabled data distribution.
    async fn wait_for_distribution_enabled(&self) -> DistributionResult<()>;

    /// Whether data distribution is currently enabled.
    async fn is_distribution_enabled(&self) -> DistributionResult<bool>;

    /// Drop a failed server's key claims, reassigning them to the given team.
    async fn remove_keys_from_failed_server(
        &self,
        server: ServerId,
        team_for_dropped_range: Vec<ServerId>,
        lock: MoveKeysLock,
    ) -> DistributionResult<()>;

    /// Remove a storage server (and its paired testing server) from the
    /// cluster directory.
    async fn remove_storage_server(
        &self,
        server: ServerId,
        tss_pair: Option<ServerId>,
        lock: MoveKeysLock,
    ) -> DistributionResult<()>;

    /// The storage-server directory.
    async fn get_server_list(&self) -> DistributionResult<Vec<StorageServerInfo>>;

    /// Current replica locations for a range, split at ownership boundaries.
    /// May return a prefix of the requested range; callers iterate.
    async fn get_source_server_interfaces_for_range(
        &self,
        range: &KeyRange,
    ) -> DistributionResult<Vec<RangeLocations>>;

    /// Persist a brand-new audit state and allocate its id.
    async fn persist_new_audit_state(
        &self,
        state: &AuditState,
        lock: MoveKeysLock,
    ) -> DistributionResult<AuditId>;

    /// Persist an audit state transition.
    async fn persist_audit_state(
        &self,
        state: &AuditState,
        context: &str,
        lock: MoveKeysLock,
    ) -> DistributionResult<()>;

    /// Persisted per-range audit progress, in key order, starting at
    /// `range.begin`. The last returned state's range ends at `range.end` or
    /// earlier (callers iterate). Ranges with no recorded progress come back
    /// with phase `Invalid`.
    async fn get_audit_states_by_range(
        &self,
        audit_type: AuditType,
        audit_id: AuditId,
        range: &KeyRange,
    ) -> DistributionResult<Vec<AuditState>>;

    /// Like [`Self::get_audit_states_by_range`] but for progress recorded per
    /// storage server.
    async fn get_audit_states_by_server(
        &self,
        audit_type: AuditType,
        audit_id: AuditId,
        server: ServerId,
        range: &KeyRange,
    ) -> DistributionResult<Vec<AuditState>>;

    /// Clear completed data-move tombstones. Best effort for callers; the
    /// write itself is transactional.
    async fn remove_data_move_tombstones(&self, ids: &[DataMoveId]) -> DistributionResult<()>;

    /// Persist wiggle round statistics for one region role.
    async fn update_storage_wiggle_metrics(
        &self,
        primary: bool,
        metrics: &WiggleMetrics,
    ) -> DistributionResult<()>;

    /// Read persisted wiggle round statistics for one region role.
    async fn read_storage_wiggle_metrics(
        &self,
        primary: bool,
    ) -> DistributionResult<Option<WiggleMetrics>>;

    /// Set or clear the durable "a snapshot is in progress" flag.
    async fn set_write_recovery_flag(&self, in_progress: bool) -> DistributionResult<()>;

    /// Register a new storage server in the cluster directory (used by the
    /// blob-restore handshake before movement starts).
    async fn add_storage_server(&self, server: StorageServerInfo) -> DistributionResult<()>;

    /// Persist the blob-restore preparation marker for the given range.
    async fn prepare_blob_restore(
        &self,
        lock: MoveKeysLock,
        keys: KeyRange,
        new_server: ServerId,
        requester: ServerId,
    ) -> DistributionResult<()>;
}
