//! The distributor: bootstrap state machine, bootstrap replay, and the
//! steady-state supervision loop.
//!
//! One [`DataDistributor`] value is one incarnation. Its life is a loop:
//!
//! 1. **Bootstrap** ([`DataDistributor::init`]): wait until distribution is
//!    enabled, take the move-keys lock (fencing out any predecessor), load
//!    the configuration, publish replica keys, and read the initial
//!    distribution snapshot. Every step is idempotent and ordered so a crash
//!    at any point leaves only recoverable state.
//! 2. **Replay** ([`DataDistributor::resume_relocations`]): rebuild the live
//!    shard map from the snapshot and re-emit relocations for everything the
//!    previous incarnation left in flight.
//! 3. **Steady state**: assemble the graph — tracker, queue, team
//!    collections, the yielding relocation bridge, watchers — and run it
//!    until an error classifies as either "rebuild the graph" or "die".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use backon::Retryable;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use super::audit::{AuditType, DdAudit};
use super::config::{DatabaseConfiguration, DistributorConfig};
use super::enabled_state::DdEnabledState;
use super::error::{DistributionError, DistributionResult};
use super::external::{
    ComponentFactory, QueueParams, ShardMetricsRequest, SnapshotTransport, StorageAuditClient,
    TeamCollection, TeamCollectionParams, TenantCache, TrackerParams,
};
use super::initial_snapshot::{DistributionMode, InitialDataDistribution};
use super::physical_shards::{monitor_physical_shard_status, PhysicalShardCollection};
use super::relocation::{relocation_pipeline, RelocateReason, RelocateShard, RelocationProducer};
use super::retry::txn_policy;
use super::rpc::PrepareBlobRestoreRequest;
use super::shard_map::ShardTeamMap;
use super::tasks::{ReadySignal, TaskGroup};
use super::txn_processor::{MoveKeysLock, TxnProcessor};
use crate::constants::PHYSICAL_SHARD_METRICS_DELAY;
use crate::types::{
    AuditId, DcId, DistributorId, Key, KeyRange, ServerId, Team, ANONYMOUS_DATA_MOVE,
};

/// Mutable per-incarnation state. Guarded by a plain mutex; never held
/// across a suspension point.
pub(crate) struct DistributorState {
    pub(crate) lock: MoveKeysLock,
    pub(crate) configuration: DatabaseConfiguration,
    pub(crate) primary_dc_ids: Vec<DcId>,
    pub(crate) remote_dc_ids: Vec<DcId>,
    pub(crate) init_data: Option<Arc<InitialDataDistribution>>,
    pub(crate) shard_map: Option<Arc<RwLock<ShardTeamMap>>>,
    pub(crate) physical_shards: Option<Arc<RwLock<PhysicalShardCollection>>>,
    pub(crate) relocation_producer: Option<RelocationProducer>,
    pub(crate) team_collection: Option<Arc<dyn TeamCollection>>,
    pub(crate) remote_team_collection: Option<Arc<dyn TeamCollection>>,
    pub(crate) tenant_cache: Option<Arc<dyn TenantCache>>,
    pub(crate) shard_metrics_tx: Option<mpsc::UnboundedSender<ShardMetricsRequest>>,
    pub(crate) blob_restore_tx: Option<mpsc::UnboundedSender<PrepareBlobRestoreRequest>>,
    pub(crate) initialized: ReadySignal,
    pub(crate) audit_initialized: ReadySignal,
}

impl Default for DistributorState {
    fn default() -> Self {
        Self {
            lock: MoveKeysLock::default(),
            configuration: DatabaseConfiguration::default(),
            primary_dc_ids: Vec::new(),
            remote_dc_ids: Vec::new(),
            init_data: None,
            shard_map: None,
            physical_shards: None,
            relocation_producer: None,
            team_collection: None,
            remote_team_collection: None,
            tenant_cache: None,
            shard_metrics_tx: None,
            blob_restore_tx: None,
            initialized: ReadySignal::new(),
            audit_initialized: ReadySignal::new(),
        }
    }
}

/// The cluster-wide singleton deciding where every key range lives.
pub struct DataDistributor {
    pub(crate) id: DistributorId,
    pub(crate) knobs: DistributorConfig,
    pub(crate) txn: Arc<dyn TxnProcessor>,
    pub(crate) audit_client: Arc<dyn StorageAuditClient>,
    pub(crate) snapshot_transport: Arc<dyn SnapshotTransport>,
    pub(crate) enabled_state: Arc<DdEnabledState>,
    /// Bumped on cluster recovery; aborts in-flight snapshots.
    pub(crate) cluster_epoch: watch::Receiver<u64>,
    /// Bumped on distribution-configuration changes; rebuilds the graph.
    pub(crate) config_epoch: watch::Receiver<u64>,
    pub(crate) state: Mutex<DistributorState>,
    pub(crate) audits: Mutex<HashMap<AuditType, HashMap<AuditId, Arc<DdAudit>>>>,
    /// Tasks that outlive one graph round (tombstone cleanup, blob-restore
    /// preparation).
    pub(crate) background: TaskGroup,
    // Keep default epoch channels alive when the embedder supplies none.
    _epoch_senders: Vec<watch::Sender<u64>>,
}

/// Builder for [`DataDistributor`].
#[derive(Default)]
pub struct DataDistributorBuilder {
    id: Option<DistributorId>,
    knobs: Option<DistributorConfig>,
    txn: Option<Arc<dyn TxnProcessor>>,
    audit_client: Option<Arc<dyn StorageAuditClient>>,
    snapshot_transport: Option<Arc<dyn SnapshotTransport>>,
    enabled_state: Option<Arc<DdEnabledState>>,
    cluster_epoch: Option<watch::Receiver<u64>>,
    config_epoch: Option<watch::Receiver<u64>>,
}

impl DataDistributorBuilder {
    pub fn id(mut self, id: DistributorId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn knobs(mut self, knobs: DistributorConfig) -> Self {
        self.knobs = Some(knobs);
        self
    }

    pub fn txn_processor(mut self, txn: Arc<dyn TxnProcessor>) -> Self {
        self.txn = Some(txn);
        self
    }

    pub fn audit_client(mut self, client: Arc<dyn StorageAuditClient>) -> Self {
        self.audit_client = Some(client);
        self
    }

    pub fn snapshot_transport(mut self, transport: Arc<dyn SnapshotTransport>) -> Self {
        self.snapshot_transport = Some(transport);
        self
    }

    pub fn enabled_state(mut self, state: Arc<DdEnabledState>) -> Self {
        self.enabled_state = Some(state);
        self
    }

    /// Watch bumped on cluster recovery (controller generation changes).
    pub fn cluster_epoch(mut self, epoch: watch::Receiver<u64>) -> Self {
        self.cluster_epoch = Some(epoch);
        self
    }

    /// Watch bumped when the distribution configuration changes.
    pub fn config_epoch(mut self, epoch: watch::Receiver<u64>) -> Self {
        self.config_epoch = Some(epoch);
        self
    }

    /// Build the distributor. Panics if a required collaborator is missing.
    pub fn build(self) -> Arc<DataDistributor> {
        let mut epoch_senders = Vec::new();
        let cluster_epoch = self.cluster_epoch.unwrap_or_else(|| {
            let (tx, rx) = watch::channel(0);
            epoch_senders.push(tx);
            rx
        });
        let config_epoch = self.config_epoch.unwrap_or_else(|| {
            let (tx, rx) = watch::channel(0);
            epoch_senders.push(tx);
            rx
        });
        Arc::new(DataDistributor {
            id: self.id.unwrap_or_else(DistributorId::new_v4),
            knobs: self.knobs.unwrap_or_default(),
            txn: self.txn.expect("a txn processor is required"),
            audit_client: self.audit_client.expect("an audit client is required"),
            snapshot_transport: self
                .snapshot_transport
                .expect("a snapshot transport is required"),
            enabled_state: self.enabled_state.unwrap_or_default(),
            cluster_epoch,
            config_epoch,
            state: Mutex::new(DistributorState::default()),
            audits: Mutex::new(HashMap::new()),
            background: TaskGroup::new(),
            _epoch_senders: epoch_senders,
        })
    }
}

impl DataDistributor {
    pub fn builder() -> DataDistributorBuilder {
        DataDistributorBuilder::default()
    }

    pub fn id(&self) -> DistributorId {
        self.id
    }

    pub fn enabled_state(&self) -> &Arc<DdEnabledState> {
        &self.enabled_state
    }

    pub(crate) fn lock(&self) -> MoveKeysLock {
        self.state.lock().expect("state lock poisoned").lock
    }

    pub(crate) fn configuration(&self) -> DatabaseConfiguration {
        self.state
            .lock()
            .expect("state lock poisoned")
            .configuration
            .clone()
    }

    pub(crate) fn initialized_signal(&self) -> ReadySignal {
        self.state
            .lock()
            .expect("state lock poisoned")
            .initialized
            .clone()
    }

    pub(crate) fn audit_initialized_signal(&self) -> ReadySignal {
        self.state
            .lock()
            .expect("state lock poisoned")
            .audit_initialized
            .clone()
    }

    pub(crate) fn init_data(&self) -> Option<Arc<InitialDataDistribution>> {
        self.state.lock().expect("state lock poisoned").init_data.clone()
    }

    pub(crate) fn shard_map(&self) -> DistributionResult<Arc<RwLock<ShardTeamMap>>> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .shard_map
            .clone()
            .ok_or_else(|| DistributionError::Internal("shard map not initialized".to_string()))
    }

    pub(crate) fn relocation_producer(&self) -> DistributionResult<RelocationProducer> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .relocation_producer
            .clone()
            .ok_or(DistributionError::BrokenPromise)
    }

    pub(crate) fn team_collections(
        &self,
    ) -> (Option<Arc<dyn TeamCollection>>, Option<Arc<dyn TeamCollection>>) {
        let state = self.state.lock().expect("state lock poisoned");
        (
            state.team_collection.clone(),
            state.remote_team_collection.clone(),
        )
    }

    pub(crate) fn tenant_cache(&self) -> Option<Arc<dyn TenantCache>> {
        self.state.lock().expect("state lock poisoned").tenant_cache.clone()
    }

    pub(crate) fn shard_metrics_tx(
        &self,
    ) -> Option<mpsc::UnboundedSender<ShardMetricsRequest>> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .shard_metrics_tx
            .clone()
    }

    pub(crate) fn blob_restore_tx(
        &self,
    ) -> Option<mpsc::UnboundedSender<PrepareBlobRestoreRequest>> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .blob_restore_tx
            .clone()
    }

    /// Bootstrap: repeat until the operator mode is enabled and movement is
    /// allowed. The lock is taken *before* the configuration read so two
    /// distributors cannot both act on the same snapshot.
    pub async fn init(self: &Arc<Self>) -> DistributionResult<()> {
        loop {
            self.txn.wait_for_distribution_enabled().await?;
            info!(distributor_id = %self.id, "data distribution enabled");

            info!(distributor_id = %self.id, "taking move-keys lock");
            let lock = self.txn.take_move_keys_lock(self.id).await?;
            info!(distributor_id = %self.id, "took move-keys lock");

            let configuration = self.txn.get_database_configuration().await?;
            configuration.validate()?;
            let primary_dc_ids = configuration.primary_dc_ids();
            let remote_dc_ids = configuration.remote_dc_ids();
            info!(
                distributor_id = %self.id,
                storage_team_size = configuration.storage_team_size,
                usable_regions = configuration.usable_regions,
                "loaded database configuration"
            );

            self.txn
                .update_replica_keys(&primary_dc_ids, &remote_dc_ids, &configuration)
                .await?;
            info!(distributor_id = %self.id, "updated replica keys");

            let remote_for_snapshot = if configuration.is_multi_region() {
                remote_dc_ids.clone()
            } else {
                Vec::new()
            };
            let init_data = self
                .txn
                .get_initial_data_distribution(self.id, lock, &remote_for_snapshot)
                .await?;
            info!(
                distributor_id = %self.id,
                shards = init_data.shards.len(),
                data_moves = init_data.data_moves.len(),
                audits = init_data.audit_states.len(),
                "loaded initial data distribution"
            );

            let mode = init_data.mode;
            {
                let mut state = self.state.lock().expect("state lock poisoned");
                state.lock = lock;
                state.configuration = configuration;
                state.primary_dc_ids = primary_dc_ids;
                state.remote_dc_ids = remote_dc_ids;
                state.init_data = Some(Arc::new(init_data));
            }

            if mode == DistributionMode::Enabled && self.enabled_state.is_enabled() {
                // The mode can be flipped by an operator while an exclusive
                // operation holds the slot; both must agree before moving.
                return Ok(());
            }

            info!(distributor_id = %self.id, "data distribution disabled");
            // Zeroed telemetry so dashboards distinguish "disabled" from
            // "no data".
            info!(
                distributor_id = %self.id,
                in_flight = 0,
                in_queue = 0,
                average_shard_size = -1i64,
                unhealthy_relocations = 0,
                highest_priority = 0,
                "MovingData"
            );
            info!(distributor_id = %self.id, primary = true, total_bytes = 0, unhealthy_servers = 0, "TotalDataInFlight");
            info!(distributor_id = %self.id, primary = false, total_bytes = 0, unhealthy_servers = 0, "TotalDataInFlight");
            tokio::time::sleep(crate::constants::INIT_RETRY_DELAY).await;
        }
    }

    /// Replay the initial shard map into the live shard-team map, emitting
    /// relocations for unhealthy shards, split fragments, and untracked
    /// in-flight moves.
    pub async fn resume_from_shards(self: &Arc<Self>) -> DistributionResult<()> {
        let init_data = self
            .init_data()
            .ok_or_else(|| DistributionError::Internal("bootstrap snapshot missing".to_string()))?;
        let configuration = self.configuration();
        let shard_map = self.shard_map()?;
        let producer = self.relocation_producer()?;
        let physical_shards = self
            .state
            .lock()
            .expect("state lock poisoned")
            .physical_shards
            .clone();

        // Physical-shard bookkeeping must exist before any move is issued.
        if self.knobs.shard_encode_location_metadata {
            if let Some(physical) = &physical_shards {
                let mut physical = physical.write().await;
                for window in init_data.shards.windows(2) {
                    let shard = &window[0];
                    let keys = KeyRange::new(shard.key.clone(), window[1].key.clone());
                    let mut teams = vec![Team::new(shard.primary_src.clone(), true)];
                    if configuration.is_multi_region() {
                        teams.push(Team::new(shard.remote_src.clone(), false));
                    }
                    let (physical_id, _) = shard.src_id.as_u64_pair();
                    physical.init_physical_shard(keys, teams, physical_id);
                }
            }
        }

        let custom_boundaries: Vec<Key> = init_data
            .user_range_config
            .boundaries()
            .cloned()
            .collect();

        let mut boundary_idx = 0usize;
        let mut over_replicated = 0usize;
        for window in init_data.shards.windows(2) {
            let shard = &window[0];
            let mut begin = shard.key.clone();
            let end = window[1].key.clone();

            // Split the shard at any user-configured custom boundary.
            let mut ranges: Vec<KeyRange> = Vec::new();
            while boundary_idx < custom_boundaries.len() && custom_boundaries[boundary_idx] <= begin
            {
                boundary_idx += 1;
            }
            let mut cursor = boundary_idx;
            while cursor < custom_boundaries.len() && custom_boundaries[cursor] < end {
                ranges.push(KeyRange::new(begin.clone(), custom_boundaries[cursor].clone()));
                begin = custom_boundaries[cursor].clone();
                cursor += 1;
            }
            boundary_idx = cursor;
            ranges.push(KeyRange::new(begin, end));

            let mut teams = vec![Team::new(shard.primary_src.clone(), true)];
            if configuration.is_multi_region() {
                teams.push(Team::new(shard.remote_src.clone(), false));
            }

            for (fragment, keys) in ranges.into_iter().enumerate() {
                let mut map = shard_map.write().await;
                map.define_shard(&keys);

                let custom_replicas = configuration.storage_team_size.max(
                    init_data
                        .user_range_config
                        .value_at(&keys.begin)
                        .unwrap_or(0),
                );

                let mut unhealthy = shard.primary_src.len() != custom_replicas;
                if !unhealthy && configuration.is_multi_region() {
                    unhealthy = shard.remote_src.len() != custom_replicas;
                }
                if !unhealthy && shard.primary_src.len() > configuration.storage_team_size {
                    over_replicated += 1;
                    if over_replicated > self.knobs.max_shards_on_large_teams {
                        unhealthy = true;
                    }
                }

                debug!(
                    keys = %keys,
                    primary_src = shard.primary_src.len(),
                    remote_src = shard.remote_src.len(),
                    custom_replicas,
                    unhealthy,
                    over_replicated,
                    "replaying shard"
                );

                map.move_shard(&keys, teams.clone());
                drop(map);

                if (self.knobs.large_team_enabled() && (unhealthy || fragment > 0))
                    || (shard.has_dest && shard.dest_id == ANONYMOUS_DATA_MOVE)
                {
                    // The shard is already in flight; scheduling it again at
                    // low priority lets the queue own its completion.
                    let reason = if unhealthy {
                        RelocateReason::TeamUnhealthy
                    } else if fragment > 0 {
                        RelocateReason::SplitShard
                    } else {
                        RelocateReason::RecoverMove
                    };
                    producer.send(RelocateShard::new(keys, reason))?;
                }
            }

            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Walk the data-move map: undo cancelled or unpreservable moves, restore
    /// valid ones, then schedule tombstone cleanup.
    pub async fn resume_from_data_moves(self: &Arc<Self>) -> DistributionResult<()> {
        let init_data = self
            .init_data()
            .ok_or_else(|| DistributionError::Internal("bootstrap snapshot missing".to_string()))?;
        let shard_map = self.shard_map()?;
        let producer = self.relocation_producer()?;

        for data_move in &init_data.data_moves {
            let meta = &data_move.meta;
            if meta.ranges.is_empty() {
                warn!(move_id = %meta.id, "data move with empty range list");
                continue;
            }
            if data_move.is_cancelled()
                || (data_move.valid && !self.knobs.shard_encode_location_metadata)
            {
                let mut rs =
                    RelocateShard::new(meta.ranges[0].clone(), RelocateReason::RecoverMove);
                rs.data_move_id = meta.id;
                rs.cancelled = true;
                producer.send(rs)?;
                info!(move_id = %meta.id, "scheduled cancellation of data move");
            } else if data_move.valid {
                debug!(move_id = %meta.id, range = %meta.ranges[0], "restoring data move");
                let mut rs =
                    RelocateShard::new(meta.ranges[0].clone(), RelocateReason::RecoverMove);
                rs.data_move_id = meta.id;
                rs.data_move = Some(Arc::new(data_move.clone()));
                let mut teams = vec![Team::new(data_move.primary_dest.clone(), true)];
                if !data_move.remote_dest.is_empty() {
                    teams.push(Team::new(data_move.remote_dest.clone(), false));
                }

                // A move can cover several ranges (e.g. a merge): define the
                // target shard and restart its tracking as one unit, and
                // register the destination so team failures are captured.
                let mut map = shard_map.write().await;
                map.restart_shard_tracker(rs.keys.clone());
                map.define_shard(&rs.keys);
                map.move_shard(&rs.keys, teams);
                drop(map);

                producer.send(rs)?;
                tokio::task::yield_now().await;
            }
        }

        let this = Arc::clone(self);
        self.background
            .add(this.remove_data_move_tombstones_background());
        Ok(())
    }

    /// Resume in-flight relocations from the previous incarnation. The shard
    /// replay strictly precedes the data-move walk.
    pub async fn resume_relocations(self: &Arc<Self>) -> DistributionResult<()> {
        self.resume_from_shards().await?;
        self.resume_from_data_moves().await
    }

    /// Best-effort deletion of completed data-move tombstones. Failure is
    /// logged and swallowed; only cancellation propagates.
    async fn remove_data_move_tombstones_background(
        self: Arc<Self>,
    ) -> DistributionResult<()> {
        let ids = self
            .init_data()
            .map(|d| d.to_clean_tombstones.clone())
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(());
        }
        let txn = Arc::clone(&self.txn);
        let result = (|| async { txn.remove_data_move_tombstones(&ids).await })
            .retry(txn_policy())
            .when(|e| matches!(e, DistributionError::Txn(_)))
            .await;
        match result {
            Ok(()) => {
                debug!(count = ids.len(), "removed data move tombstones");
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(error = %e, "failed to remove data move tombstones");
                Ok(())
            }
        }
    }

    /// Run the supervision loop until a fatal error. Recoverable errors tear
    /// the steady-state graph down and rebuild it from persisted metadata.
    pub async fn run(
        self: Arc<Self>,
        factory: Arc<dyn ComponentFactory>,
    ) -> DistributionResult<()> {
        loop {
            // Fresh latches for this round.
            {
                let mut state = self.state.lock().expect("state lock poisoned");
                state.initialized = ReadySignal::new();
                state.audit_initialized = ReadySignal::new();
            }
            let (remove_failed_tx, remove_failed_rx) = watch::channel(None::<ServerId>);
            let graph = TaskGroup::new();

            let round = self
                .build_and_run_graph(&factory, remove_failed_tx, &graph)
                .await;
            let err = match round {
                // The graph never finishes by itself.
                Ok(()) => DistributionError::Internal("steady-state graph exited".to_string()),
                Err(e) => e,
            };
            graph.cancel_all();
            info!(distributor_id = %self.id, error = %err, "tearing down graph");

            // Choose a random healthy team for a dropped range before the
            // collections go away.
            let failed_server = *remove_failed_rx.borrow();
            let mut team_for_dropped_range: Vec<ServerId> = Vec::new();
            if let Some(server) = failed_server {
                let (primary, remote) = self.team_collections();
                if let Some(primary) = primary {
                    team_for_dropped_range.extend(primary.random_healthy_team(server).await);
                }
                if let Some(remote) = remote {
                    team_for_dropped_range.extend(remote.random_healthy_team(server).await);
                }
            }
            self.clear_round_components();

            if err.is_cancelled() {
                // Clear shards before unwinding so no task can observe a
                // dead incarnation's map.
                if let Ok(map) = self.shard_map() {
                    map.write().await.clear();
                }
                return Err(err);
            }

            if let Some(server) = failed_server {
                error!(distributor_id = %self.id, server = %server, error = %err, "removing failed server");
                self.txn
                    .remove_keys_from_failed_server(server, team_for_dropped_range, self.lock())
                    .await?;
                self.txn
                    .remove_storage_server(server, None, self.lock())
                    .await?;
            } else if matches!(
                err,
                DistributionError::MoveKeysConflict | DistributionError::ConfigChanged
            ) {
                let enabled = self.txn.is_distribution_enabled().await?;
                info!(distributor_id = %self.id, error = %err, enabled, "distribution interrupted");
                if !enabled {
                    return Err(err);
                }
            } else if !err.is_normal_distributor_error() {
                error!(distributor_id = %self.id, error = %err, "fatal distribution error");
                return Err(err);
            }

            super::metrics::graph_restarted();
        }
    }

    /// Assemble and run one round of the steady-state graph. Returns the
    /// first component error.
    async fn build_and_run_graph(
        self: &Arc<Self>,
        factory: &Arc<dyn ComponentFactory>,
        remove_failed_tx: watch::Sender<Option<ServerId>>,
        graph: &TaskGroup,
    ) -> DistributionResult<()> {
        // Establish the configuration-watch baseline before init reads the
        // configuration, so a change racing with init still tears us down.
        let mut config_epoch = self.config_epoch.clone();
        config_epoch.borrow_and_update();

        self.init().await?;

        let configuration = self.configuration();
        let lock = self.lock();
        let (primary_dc_ids, remote_dc_ids) = {
            let state = self.state.lock().expect("state lock poisoned");
            (state.primary_dc_ids.clone(), state.remote_dc_ids.clone())
        };

        let shard_map = Arc::new(RwLock::new(ShardTeamMap::new()));
        let physical_shards = Arc::new(RwLock::new(PhysicalShardCollection::new()));
        let (producer, consumer_rx, bridge) =
            relocation_pipeline(self.knobs.relocation_consumer_depth);
        let (metrics_tx, metrics_rx) = mpsc::unbounded_channel();
        let (blob_tx, blob_rx) = mpsc::unbounded_channel();
        let tenant_cache = factory.tenant_cache();
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.shard_map = Some(shard_map.clone());
            state.physical_shards = Some(physical_shards.clone());
            state.relocation_producer = Some(producer.clone());
            state.shard_metrics_tx = Some(metrics_tx);
            state.blob_restore_tx = Some(blob_tx);
            state.tenant_cache = tenant_cache.clone();
        }

        self.resume_relocations().await?;

        // Healthy-team observables: one per region, plus the disjunction.
        let (zero_primary_tx, zero_primary_rx) = watch::channel(true);
        let multi_region = configuration.is_multi_region();
        let mut replica_size = configuration.storage_team_size;
        let (zero_remote_tx, zero_remote_rx) = watch::channel(true);
        let any_zero_rx = if multi_region {
            replica_size = 2 * configuration.storage_team_size;
            let (any_tx, any_rx) = watch::channel(true);
            graph.add(any_true(
                vec![zero_primary_rx.clone(), zero_remote_rx.clone()],
                any_tx,
            ));
            any_rx
        } else {
            zero_primary_rx.clone()
        };

        self.resume_storage_audits();

        // Lock poller: resolves only on a fencing conflict.
        {
            let txn = Arc::clone(&self.txn);
            graph.add(async move { txn.poll_move_keys_lock(lock).await });
        }

        // Configuration watcher.
        graph.add(async move {
            match config_epoch.changed().await {
                Ok(()) => {
                    info!("distribution configuration changed");
                    Err(DistributionError::ConfigChanged)
                }
                // The epoch source went away; nothing left to watch.
                Err(_) => std::future::pending().await,
            }
        });

        let init_data = self
            .init_data()
            .ok_or_else(|| DistributionError::Internal("bootstrap snapshot missing".to_string()))?;

        // Shard tracker.
        {
            let params = TrackerParams {
                distributor_id: self.id,
                init_data: init_data.clone(),
                output: producer.clone(),
                shard_map: shard_map.clone(),
                physical_shards: physical_shards.clone(),
                ready: self.initialized_signal(),
                any_zero_healthy_teams: any_zero_rx,
                metrics_requests: metrics_rx,
            };
            let factory = Arc::clone(factory);
            graph.add(report_errors_except(
                async move { factory.run_tracker(params).await },
                "ShardTracker",
            ));
        }

        // Relocation queue.
        {
            let params = QueueParams {
                distributor_id: self.id,
                lock,
                relocations: consumer_rx,
                team_size: replica_size,
                single_region_team_size: configuration.storage_team_size,
                shard_map: shard_map.clone(),
            };
            let factory = Arc::clone(factory);
            graph.add(report_errors_except(
                async move { factory.run_queue(params).await },
                "RelocationQueue",
            ));
        }

        // Tenant cache monitors.
        if let Some(cache) = tenant_cache {
            graph.add(report_errors_except(
                async move { cache.monitor().await },
                "TenantCacheMonitor",
            ));
        }

        // Team collections: primary, then remote.
        let primary_collection = factory
            .build_team_collection(TeamCollectionParams {
                distributor_id: self.id,
                lock,
                primary: true,
                dc_ids: primary_dc_ids,
                ready: self.initialized_signal(),
                zero_healthy_teams: zero_primary_tx,
                output: producer.clone(),
                shard_map: shard_map.clone(),
                remove_failed_server: remove_failed_tx.clone(),
            })
            .await?;
        {
            let collection = primary_collection.clone();
            graph.add(report_errors_except(
                async move { collection.run().await },
                "TeamCollectionPrimary",
            ));
        }
        let remote_collection = if multi_region {
            let collection = factory
                .build_team_collection(TeamCollectionParams {
                    distributor_id: self.id,
                    lock,
                    primary: false,
                    dc_ids: remote_dc_ids,
                    ready: self.initialized_signal(),
                    zero_healthy_teams: zero_remote_tx,
                    output: producer.clone(),
                    shard_map: shard_map.clone(),
                    remove_failed_server: remove_failed_tx,
                })
                .await?;
            let run = collection.clone();
            graph.add(report_errors_except(
                async move { run.run().await },
                "TeamCollectionRemote",
            ));
            Some(collection)
        } else {
            None
        };
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.team_collection = Some(primary_collection);
            state.remote_team_collection = remote_collection;
        }

        // The yielding producer → consumer bridge.
        graph.add(bridge);

        // Physical-shard status monitor.
        if self.knobs.shard_encode_location_metadata && self.knobs.enable_physical_shard_monitor {
            graph.add(monitor_physical_shard_status(
                physical_shards,
                PHYSICAL_SHARD_METRICS_DELAY,
            ));
        }

        // Blob-migrator request server.
        graph.add(Arc::clone(self).serve_blob_restore_requests(blob_rx));

        graph.wait_any().await
    }

    fn clear_round_components(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.team_collection = None;
        state.remote_team_collection = None;
        state.tenant_cache = None;
        state.relocation_producer = None;
        state.shard_metrics_tx = None;
        state.blob_restore_tx = None;
    }

    /// Wire the per-round components directly, without running the graph.
    /// Test-only: lets replay be driven against mock state.
    #[cfg(any(test, feature = "test-utilities"))]
    pub fn install_test_round(
        &self,
        init_data: Arc<InitialDataDistribution>,
        configuration: DatabaseConfiguration,
        shard_map: Arc<RwLock<ShardTeamMap>>,
        physical_shards: Arc<RwLock<PhysicalShardCollection>>,
        producer: RelocationProducer,
    ) {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.init_data = Some(init_data);
        state.configuration = configuration;
        state.shard_map = Some(shard_map);
        state.physical_shards = Some(physical_shards);
        state.relocation_producer = Some(producer);
    }

    /// Test-only: mark this round initialized so audit launches do not wait.
    #[cfg(any(test, feature = "test-utilities"))]
    pub fn fire_init_signals_for_test(&self) {
        let state = self.state.lock().expect("state lock poisoned");
        state.initialized.fire();
        state.audit_initialized.fire();
    }

    /// Test-only: stop background tasks.
    #[cfg(any(test, feature = "test-utilities"))]
    pub fn shutdown_for_test(&self) {
        self.background.cancel_all();
        self.cancel_all_audits();
    }

    /// Test-only: resume persisted audits without running the full graph.
    #[cfg(any(test, feature = "test-utilities"))]
    pub fn resume_storage_audits_for_test(self: &Arc<Self>) {
        self.resume_storage_audits();
    }
}

/// Log unexpected component errors before propagating; expected in-flight
/// churn passes through quietly.
async fn report_errors_except<F>(task: F, name: &'static str) -> DistributionResult<()>
where
    F: std::future::Future<Output = DistributionResult<()>>,
{
    match task.await {
        Ok(()) => Ok(()),
        Err(e) => {
            if !e.is_normal_queue_error() {
                error!(component = name, error = %e, "component failed");
            }
            Err(e)
        }
    }
}

/// Maintain `out` as the disjunction of the input observables.
async fn any_true(
    mut inputs: Vec<watch::Receiver<bool>>,
    out: watch::Sender<bool>,
) -> DistributionResult<()> {
    loop {
        let value = inputs.iter().any(|rx| *rx.borrow());
        let _ = out.send(value);
        let changes = inputs
            .iter_mut()
            .map(|rx| Box::pin(rx.changed()))
            .collect::<Vec<_>>();
        let (changed, _, _) = futures::future::select_all(changes).await;
        if changed.is_err() {
            // Inputs went away; the round is tearing down.
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_any_true_follows_inputs() {
        let (a_tx, a_rx) = watch::channel(true);
        let (b_tx, b_rx) = watch::channel(true);
        let (out_tx, out_rx) = watch::channel(true);
        let task = tokio::spawn(any_true(vec![a_rx, b_rx], out_tx));

        a_tx.send(false).unwrap();
        b_tx.send(false).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!*out_rx.borrow());

        a_tx.send(true).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(*out_rx.borrow());

        drop(a_tx);
        drop(b_tx);
        task.await.unwrap().unwrap();
    }
}
