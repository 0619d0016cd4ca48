//! In-memory collaborators for testing.
//!
//! This provides full-featured in-memory implementations of the
//! distributor's trait seams — the fenced metadata store, the storage audit
//! RPC, the snapshot transport, and the steady-state component factory —
//! for comprehensive testing without a real cluster.
//!
//! Available when the `test-utilities` feature is enabled, or during unit
//! tests:
//!
//! ```toml
//! [dev-dependencies]
//! shardwise = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{watch, Mutex, RwLock};

use super::audit::{AuditPhase, AuditState, AuditType};
use super::config::DatabaseConfiguration;
use super::error::{DistributionError, DistributionResult};
use super::external::{
    ComponentFactory, QueueParams, ShardMetricsRequest, SnapshotTransport, StatefulWorkers,
    StorageAuditClient, TeamCollection, TeamCollectionParams, TenantCache, TrackerParams,
    WigglerStateSnapshot,
};
use super::initial_snapshot::{DistributionMode, InitialDataDistribution};
use super::relocation::RelocateShard;
use super::txn_processor::{MoveKeysLock, TxnProcessor};
use super::wiggler::{WiggleMetrics, WigglerPhase};
use crate::types::{
    AuditId, DataMoveId, DcId, DistributorId, Key, KeyRange, RangeLocations, ServerId,
    ShardMetric, StorageServerInfo, TenantName,
};

type RangeRows = BTreeMap<Key, AuditState>;

#[derive(Default)]
struct TxnInner {
    lock: MoveKeysLock,
    configuration: DatabaseConfiguration,
    init_data: Option<InitialDataDistribution>,
    servers: Vec<StorageServerInfo>,
    range_locations: Vec<RangeLocations>,
    audit_rows: HashMap<(AuditType, AuditId), RangeRows>,
    server_audit_rows: HashMap<(AuditType, AuditId, ServerId), RangeRows>,
    // Stored serialized, as the real metadata keyspace holds opaque rows.
    persisted_audits: HashMap<AuditId, String>,
    wiggle_metrics: HashMap<bool, WiggleMetrics>,
    removed_tombstones: Vec<DataMoveId>,
    write_recovery_flag: bool,
    replica_key_updates: usize,
    removed_servers: Vec<ServerId>,
    removed_keys_from: Vec<(ServerId, Vec<ServerId>)>,
    added_servers: Vec<StorageServerInfo>,
    blob_restores: Vec<(KeyRange, ServerId, ServerId)>,
    fail_next_persists: u32,
    fail_next_tombstone_removals: u32,
}

/// In-memory [`TxnProcessor`] with scripted fencing and failures.
pub struct MockTxnProcessor {
    inner: RwLock<TxnInner>,
    enabled: watch::Sender<bool>,
    fenced: watch::Sender<bool>,
}

impl Default for MockTxnProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTxnProcessor {
    pub fn new() -> Self {
        let (enabled, _) = watch::channel(true);
        let (fenced, _) = watch::channel(false);
        Self {
            inner: RwLock::new(TxnInner {
                configuration: DatabaseConfiguration::single_region(1),
                ..TxnInner::default()
            }),
            enabled,
            fenced,
        }
    }

    pub async fn set_configuration(&self, configuration: DatabaseConfiguration) {
        self.inner.write().await.configuration = configuration;
    }

    pub async fn set_init_data(&self, init_data: InitialDataDistribution) {
        self.inner.write().await.init_data = Some(init_data);
    }

    pub async fn set_servers(&self, servers: Vec<StorageServerInfo>) {
        self.inner.write().await.servers = servers;
    }

    pub async fn set_range_locations(&self, locations: Vec<RangeLocations>) {
        self.inner.write().await.range_locations = locations;
    }

    /// Toggle the operator's distribution-enabled switch.
    pub fn set_enabled(&self, enabled: bool) {
        let _ = self.enabled.send(enabled);
    }

    /// Fence the current lock holder, as a newer distributor would.
    pub fn fence(&self) {
        let _ = self.fenced.send(true);
    }

    /// Fail the next `n` audit-state persistence calls.
    pub async fn fail_next_persists(&self, n: u32) {
        self.inner.write().await.fail_next_persists = n;
    }

    /// Fail the next `n` tombstone removal calls.
    pub async fn fail_next_tombstone_removals(&self, n: u32) {
        self.inner.write().await.fail_next_tombstone_removals = n;
    }

    /// Record audit progress over a range, as a storage server would.
    pub async fn record_audit_progress(
        &self,
        audit_type: AuditType,
        id: AuditId,
        range: KeyRange,
        phase: AuditPhase,
    ) {
        let mut inner = self.inner.write().await;
        inner
            .audit_rows
            .entry((audit_type, id))
            .or_default()
            .insert(
                range.begin.clone(),
                AuditState {
                    id,
                    audit_type,
                    range,
                    phase,
                },
            );
    }

    /// Record per-server audit progress.
    pub async fn record_server_audit_progress(
        &self,
        audit_type: AuditType,
        id: AuditId,
        server: ServerId,
        range: KeyRange,
        phase: AuditPhase,
    ) {
        let mut inner = self.inner.write().await;
        inner
            .server_audit_rows
            .entry((audit_type, id, server))
            .or_default()
            .insert(
                range.begin.clone(),
                AuditState {
                    id,
                    audit_type,
                    range,
                    phase,
                },
            );
    }

    /// The persisted supervisor row for an audit.
    pub async fn persisted_audit(&self, id: AuditId) -> Option<AuditState> {
        self.inner
            .read()
            .await
            .persisted_audits
            .get(&id)
            .map(|row| serde_json::from_str(row).expect("stored audit row is valid"))
    }

    pub async fn removed_tombstones(&self) -> Vec<DataMoveId> {
        self.inner.read().await.removed_tombstones.clone()
    }

    pub async fn write_recovery_flag(&self) -> bool {
        self.inner.read().await.write_recovery_flag
    }

    pub async fn replica_key_updates(&self) -> usize {
        self.inner.read().await.replica_key_updates
    }

    pub async fn removed_servers(&self) -> Vec<ServerId> {
        self.inner.read().await.removed_servers.clone()
    }

    pub async fn removed_keys_from(&self) -> Vec<(ServerId, Vec<ServerId>)> {
        self.inner.read().await.removed_keys_from.clone()
    }

    pub async fn added_servers(&self) -> Vec<StorageServerInfo> {
        self.inner.read().await.added_servers.clone()
    }

    pub async fn blob_restores(&self) -> Vec<(KeyRange, ServerId, ServerId)> {
        self.inner.read().await.blob_restores.clone()
    }

    fn check_lock(inner: &TxnInner, lock: &MoveKeysLock, fenced: bool) -> DistributionResult<()> {
        if fenced || lock.my_owner != inner.lock.my_owner {
            return Err(DistributionError::MoveKeysConflict);
        }
        Ok(())
    }

    fn is_fenced(&self) -> bool {
        *self.fenced.borrow()
    }

    fn decompose(
        rows: Option<&RangeRows>,
        audit_type: AuditType,
        id: AuditId,
        range: &KeyRange,
    ) -> Vec<AuditState> {
        let invalid = |begin: Key, end: Key| AuditState {
            id,
            audit_type,
            range: KeyRange { begin, end },
            phase: AuditPhase::Invalid,
        };
        let mut out = Vec::new();
        let mut cursor = range.begin.clone();
        if let Some(rows) = rows {
            let mut overlapping: Vec<&AuditState> = rows
                .values()
                .filter(|s| s.range.intersects(range))
                .collect();
            overlapping.sort_by(|a, b| a.range.begin.cmp(&b.range.begin));
            for row in overlapping {
                if row.range.begin > cursor {
                    out.push(invalid(cursor.clone(), row.range.begin.clone()));
                    cursor = row.range.begin.clone();
                }
                let piece_begin = cursor.clone().max(row.range.begin.clone());
                let piece_end = row.range.end.clone().min(range.end.clone());
                if piece_begin < piece_end {
                    out.push(AuditState {
                        id,
                        audit_type,
                        range: KeyRange {
                            begin: piece_begin,
                            end: piece_end.clone(),
                        },
                        phase: row.phase,
                    });
                    cursor = piece_end;
                }
                if cursor >= range.end {
                    break;
                }
            }
        }
        if cursor < range.end {
            out.push(invalid(cursor, range.end.clone()));
        }
        out
    }
}

#[async_trait]
impl TxnProcessor for MockTxnProcessor {
    async fn take_move_keys_lock(
        &self,
        dd_id: DistributorId,
    ) -> DistributionResult<MoveKeysLock> {
        let mut inner = self.inner.write().await;
        let previous = inner.lock;
        let lock = MoveKeysLock {
            prev_owner: previous.my_owner,
            prev_write: previous.prev_write,
            my_owner: dd_id,
        };
        inner.lock = lock;
        let _ = self.fenced.send(false);
        Ok(lock)
    }

    async fn poll_move_keys_lock(&self, _lock: MoveKeysLock) -> DistributionResult<()> {
        let mut rx = self.fenced.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Err(DistributionError::MoveKeysConflict);
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    async fn get_database_configuration(&self) -> DistributionResult<DatabaseConfiguration> {
        Ok(self.inner.read().await.configuration.clone())
    }

    async fn update_replica_keys(
        &self,
        _primary_dc_ids: &[DcId],
        _remote_dc_ids: &[DcId],
        _configuration: &DatabaseConfiguration,
    ) -> DistributionResult<()> {
        self.inner.write().await.replica_key_updates += 1;
        Ok(())
    }

    async fn get_initial_data_distribution(
        &self,
        _dd_id: DistributorId,
        lock: MoveKeysLock,
        _remote_dc_ids: &[DcId],
    ) -> DistributionResult<InitialDataDistribution> {
        let inner = self.inner.read().await;
        Self::check_lock(&inner, &lock, self.is_fenced())?;
        let mut data = inner
            .init_data
            .clone()
            .unwrap_or_else(|| InitialDataDistribution::empty(DistributionMode::Enabled));
        if !*self.enabled.borrow() {
            data.mode = DistributionMode::Disabled;
        }
        data.validate_data_moves();
        Ok(data)
    }

    async fn wait_for_distribution_enabled(&self) -> DistributionResult<()> {
        let mut rx = self.enabled.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(DistributionError::BrokenPromise);
            }
        }
    }

    async fn is_distribution_enabled(&self) -> DistributionResult<bool> {
        Ok(*self.enabled.borrow())
    }

    async fn remove_keys_from_failed_server(
        &self,
        server: ServerId,
        team_for_dropped_range: Vec<ServerId>,
        lock: MoveKeysLock,
    ) -> DistributionResult<()> {
        let mut inner = self.inner.write().await;
        Self::check_lock(&inner, &lock, self.is_fenced())?;
        inner.removed_keys_from.push((server, team_for_dropped_range));
        Ok(())
    }

    async fn remove_storage_server(
        &self,
        server: ServerId,
        _tss_pair: Option<ServerId>,
        lock: MoveKeysLock,
    ) -> DistributionResult<()> {
        let mut inner = self.inner.write().await;
        Self::check_lock(&inner, &lock, self.is_fenced())?;
        inner.removed_servers.push(server);
        inner.servers.retain(|s| s.id != server);
        Ok(())
    }

    async fn get_server_list(&self) -> DistributionResult<Vec<StorageServerInfo>> {
        Ok(self.inner.read().await.servers.clone())
    }

    async fn get_source_server_interfaces_for_range(
        &self,
        range: &KeyRange,
    ) -> DistributionResult<Vec<RangeLocations>> {
        let inner = self.inner.read().await;
        Ok(inner
            .range_locations
            .iter()
            .filter(|loc| loc.range.intersects(range))
            .map(|loc| {
                // Clip to the requested range, as the real metadata layer
                // does.
                let mut clipped = loc.clone();
                clipped.range = KeyRange {
                    begin: loc.range.begin.clone().max(range.begin.clone()),
                    end: loc.range.end.clone().min(range.end.clone()),
                };
                clipped
            })
            .collect())
    }

    async fn persist_new_audit_state(
        &self,
        state: &AuditState,
        lock: MoveKeysLock,
    ) -> DistributionResult<AuditId> {
        let mut inner = self.inner.write().await;
        Self::check_lock(&inner, &lock, self.is_fenced())?;
        if inner.fail_next_persists > 0 {
            inner.fail_next_persists -= 1;
            return Err(DistributionError::Txn("persist failure injected".to_string()));
        }
        let id = AuditId::new_v4();
        let mut stored = state.clone();
        stored.id = id;
        let row = serde_json::to_string(&stored)
            .map_err(|e| DistributionError::Txn(e.to_string()))?;
        inner.persisted_audits.insert(id, row);
        Ok(id)
    }

    async fn persist_audit_state(
        &self,
        state: &AuditState,
        _context: &str,
        lock: MoveKeysLock,
    ) -> DistributionResult<()> {
        let mut inner = self.inner.write().await;
        Self::check_lock(&inner, &lock, self.is_fenced())?;
        if inner.fail_next_persists > 0 {
            inner.fail_next_persists -= 1;
            return Err(DistributionError::Txn("persist failure injected".to_string()));
        }
        let row = serde_json::to_string(state)
            .map_err(|e| DistributionError::Txn(e.to_string()))?;
        inner.persisted_audits.insert(state.id, row);
        Ok(())
    }

    async fn get_audit_states_by_range(
        &self,
        audit_type: AuditType,
        audit_id: AuditId,
        range: &KeyRange,
    ) -> DistributionResult<Vec<AuditState>> {
        let inner = self.inner.read().await;
        Ok(Self::decompose(
            inner.audit_rows.get(&(audit_type, audit_id)),
            audit_type,
            audit_id,
            range,
        ))
    }

    async fn get_audit_states_by_server(
        &self,
        audit_type: AuditType,
        audit_id: AuditId,
        server: ServerId,
        range: &KeyRange,
    ) -> DistributionResult<Vec<AuditState>> {
        let inner = self.inner.read().await;
        Ok(Self::decompose(
            inner.server_audit_rows.get(&(audit_type, audit_id, server)),
            audit_type,
            audit_id,
            range,
        ))
    }

    async fn remove_data_move_tombstones(&self, ids: &[DataMoveId]) -> DistributionResult<()> {
        let mut inner = self.inner.write().await;
        if inner.fail_next_tombstone_removals > 0 {
            inner.fail_next_tombstone_removals -= 1;
            return Err(DistributionError::Txn(
                "tombstone removal failure injected".to_string(),
            ));
        }
        inner.removed_tombstones.extend_from_slice(ids);
        Ok(())
    }

    async fn update_storage_wiggle_metrics(
        &self,
        primary: bool,
        metrics: &WiggleMetrics,
    ) -> DistributionResult<()> {
        self.inner
            .write()
            .await
            .wiggle_metrics
            .insert(primary, *metrics);
        Ok(())
    }

    async fn read_storage_wiggle_metrics(
        &self,
        primary: bool,
    ) -> DistributionResult<Option<WiggleMetrics>> {
        Ok(self.inner.read().await.wiggle_metrics.get(&primary).copied())
    }

    async fn set_write_recovery_flag(&self, in_progress: bool) -> DistributionResult<()> {
        self.inner.write().await.write_recovery_flag = in_progress;
        Ok(())
    }

    async fn add_storage_server(&self, server: StorageServerInfo) -> DistributionResult<()> {
        let mut inner = self.inner.write().await;
        inner.added_servers.push(server.clone());
        inner.servers.push(server);
        Ok(())
    }

    async fn prepare_blob_restore(
        &self,
        lock: MoveKeysLock,
        keys: KeyRange,
        new_server: ServerId,
        requester: ServerId,
    ) -> DistributionResult<()> {
        let mut inner = self.inner.write().await;
        Self::check_lock(&inner, &lock, self.is_fenced())?;
        inner.blob_restores.push((keys, new_server, requester));
        Ok(())
    }
}

/// Scripted [`StorageAuditClient`]: succeeds by recording completed progress
/// into the mock metadata store, with an optional run of injected failures.
pub struct MockStorageAuditClient {
    txn: Arc<MockTxnProcessor>,
    fail_next: AtomicU32,
    fail_with: std::sync::Mutex<DistributionError>,
    calls: AtomicU64,
}

impl MockStorageAuditClient {
    pub fn new(txn: Arc<MockTxnProcessor>) -> Self {
        Self {
            txn,
            fail_next: AtomicU32::new(0),
            fail_with: std::sync::Mutex::new(DistributionError::BrokenPromise),
            calls: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` audit calls with `error`.
    pub fn fail_next(&self, n: u32, error: DistributionError) {
        *self.fail_with.lock().expect("fail_with lock poisoned") = error;
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageAuditClient for MockStorageAuditClient {
    async fn audit_storage(
        &self,
        server: ServerId,
        request: super::audit::AuditRequest,
    ) -> DistributionResult<AuditState> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(self.fail_with.lock().expect("fail_with lock poisoned").clone());
        }
        let phase = AuditPhase::Complete;
        if request.audit_type == AuditType::ValidateStorageServerShard {
            self.txn
                .record_server_audit_progress(
                    request.audit_type,
                    request.id,
                    server,
                    request.range.clone(),
                    phase,
                )
                .await;
        } else {
            self.txn
                .record_audit_progress(
                    request.audit_type,
                    request.id,
                    request.range.clone(),
                    phase,
                )
                .await;
        }
        Ok(AuditState {
            id: request.id,
            audit_type: request.audit_type,
            range: request.range,
            phase,
        })
    }
}

/// Scripted [`SnapshotTransport`] that records the call order.
pub struct MockSnapshotTransport {
    tlogs: Vec<ServerId>,
    workers: StatefulWorkers,
    failing_workers: std::sync::Mutex<HashSet<ServerId>>,
    fail_disable: AtomicBool,
    calls: std::sync::Mutex<Vec<String>>,
    maybe_delivered: std::sync::Mutex<HashMap<ServerId, u32>>,
    snap_delay_ms: AtomicU64,
}

impl MockSnapshotTransport {
    pub fn new(tlogs: Vec<ServerId>, workers: StatefulWorkers) -> Self {
        Self {
            tlogs,
            workers,
            failing_workers: std::sync::Mutex::new(HashSet::new()),
            fail_disable: AtomicBool::new(false),
            calls: std::sync::Mutex::new(Vec::new()),
            maybe_delivered: std::sync::Mutex::new(HashMap::new()),
            snap_delay_ms: AtomicU64::new(0),
        }
    }

    /// Delay every snapshot request, to widen the in-flight window.
    pub fn set_snap_delay_ms(&self, ms: u64) {
        self.snap_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Make snapshot requests to `worker` fail outright.
    pub fn fail_worker(&self, worker: ServerId) {
        self.failing_workers
            .lock()
            .expect("failing workers lock poisoned")
            .insert(worker);
    }

    /// Make every disable-tlog-pop call fail.
    pub fn fail_disable_pop(&self) {
        self.fail_disable.store(true, Ordering::SeqCst);
    }

    /// Lose the next `n` snapshot deliveries to `worker` in the network.
    pub fn lose_deliveries(&self, worker: ServerId, n: u32) {
        self.maybe_delivered
            .lock()
            .expect("maybe delivered lock poisoned")
            .insert(worker, n);
    }

    /// The ordered log of transport calls.
    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().expect("call log lock poisoned").clone()
    }

    fn log(&self, entry: String) {
        self.calls.lock().expect("call log lock poisoned").push(entry);
    }
}

#[async_trait]
impl SnapshotTransport for MockSnapshotTransport {
    async fn local_tlogs(&self) -> DistributionResult<Vec<ServerId>> {
        Ok(self.tlogs.clone())
    }

    async fn disable_tlog_pop(
        &self,
        tlog: ServerId,
        _snap_id: crate::types::SnapshotId,
    ) -> DistributionResult<()> {
        self.log(format!("disable:{tlog}"));
        if self.fail_disable.load(Ordering::SeqCst) {
            return Err(DistributionError::OperationFailed);
        }
        Ok(())
    }

    async fn enable_tlog_pop(
        &self,
        tlog: ServerId,
        _snap_id: crate::types::SnapshotId,
    ) -> DistributionResult<()> {
        self.log(format!("enable:{tlog}"));
        Ok(())
    }

    async fn stateful_workers(&self) -> DistributionResult<StatefulWorkers> {
        Ok(self.workers.clone())
    }

    async fn snap_worker(
        &self,
        worker: ServerId,
        _payload: &Bytes,
        _snap_id: crate::types::SnapshotId,
        role: &str,
    ) -> DistributionResult<()> {
        self.log(format!("snap:{role}:{worker}"));
        let delay = self.snap_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        {
            let mut lost = self
                .maybe_delivered
                .lock()
                .expect("maybe delivered lock poisoned");
            if let Some(n) = lost.get_mut(&worker) {
                if *n > 0 {
                    *n -= 1;
                    return Err(DistributionError::RequestMaybeDelivered);
                }
            }
        }
        if self
            .failing_workers
            .lock()
            .expect("failing workers lock poisoned")
            .contains(&worker)
        {
            return Err(DistributionError::OperationFailed);
        }
        Ok(())
    }
}

/// Static [`TeamCollection`] with configurable teams and safety answer.
pub struct MockTeamCollection {
    primary: bool,
    teams: std::sync::Mutex<Vec<Vec<ServerId>>>,
    safe: AtomicBool,
    wiggler: std::sync::Mutex<WigglerStateSnapshot>,
}

impl MockTeamCollection {
    pub fn new(primary: bool, teams: Vec<Vec<ServerId>>) -> Self {
        Self {
            primary,
            teams: std::sync::Mutex::new(teams),
            safe: AtomicBool::new(true),
            wiggler: std::sync::Mutex::new(WigglerStateSnapshot {
                phase: WigglerPhase::Pause,
                last_state_change_ms: 0,
            }),
        }
    }

    pub fn set_safe(&self, safe: bool) {
        self.safe.store(safe, Ordering::SeqCst);
    }

    pub fn set_teams(&self, teams: Vec<Vec<ServerId>>) {
        *self.teams.lock().expect("teams lock poisoned") = teams;
    }
}

#[async_trait]
impl TeamCollection for MockTeamCollection {
    fn is_primary(&self) -> bool {
        self.primary
    }

    async fn run(&self) -> DistributionResult<()> {
        std::future::pending().await
    }

    async fn team_count(&self) -> usize {
        self.teams.lock().expect("teams lock poisoned").len()
    }

    async fn random_healthy_team(&self, excluding: ServerId) -> Vec<ServerId> {
        self.teams
            .lock()
            .expect("teams lock poisoned")
            .iter()
            .find(|team| !team.contains(&excluding))
            .cloned()
            .unwrap_or_default()
    }

    async fn exclusion_safety_check(&self, _exclude: &[ServerId]) -> bool {
        self.safe.load(Ordering::SeqCst)
    }

    async fn wiggler_state(&self) -> WigglerStateSnapshot {
        *self.wiggler.lock().expect("wiggler lock poisoned")
    }
}

/// Factory wiring mock components: the tracker answers metrics requests and
/// fires the ready latch; the queue drains relocations into a shared vector.
pub struct MockComponentFactory {
    pub collected: Arc<Mutex<Vec<RelocateShard>>>,
    pub primary_collection: Arc<MockTeamCollection>,
    pub remote_collection: Arc<MockTeamCollection>,
    metrics: std::sync::Mutex<Vec<ShardMetric>>,
    tenant_cache: std::sync::Mutex<Option<Arc<dyn TenantCache>>>,
}

impl Default for MockComponentFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockComponentFactory {
    pub fn new() -> Self {
        Self {
            collected: Arc::new(Mutex::new(Vec::new())),
            primary_collection: Arc::new(MockTeamCollection::new(true, vec![])),
            remote_collection: Arc::new(MockTeamCollection::new(false, vec![])),
            metrics: std::sync::Mutex::new(Vec::new()),
            tenant_cache: std::sync::Mutex::new(None),
        }
    }

    pub fn set_metrics(&self, metrics: Vec<ShardMetric>) {
        *self.metrics.lock().expect("metrics lock poisoned") = metrics;
    }

    pub fn set_tenant_cache(&self, cache: Arc<dyn TenantCache>) {
        *self
            .tenant_cache
            .lock()
            .expect("tenant cache lock poisoned") = Some(cache);
    }

    pub async fn collected_relocations(&self) -> Vec<RelocateShard> {
        self.collected.lock().await.clone()
    }
}

#[async_trait]
impl ComponentFactory for MockComponentFactory {
    async fn build_team_collection(
        &self,
        params: TeamCollectionParams,
    ) -> DistributionResult<Arc<dyn TeamCollection>> {
        Ok(if params.primary {
            self.primary_collection.clone()
        } else {
            self.remote_collection.clone()
        })
    }

    async fn run_tracker(&self, mut params: TrackerParams) -> DistributionResult<()> {
        params.ready.fire();
        while let Some(request) = params.metrics_requests.recv().await {
            let metrics: Vec<ShardMetric> = self
                .metrics
                .lock()
                .expect("metrics lock poisoned")
                .iter()
                .filter(|m| m.range.intersects(&request.keys))
                .take(request.shard_limit)
                .cloned()
                .collect();
            let _ = request.reply.send(metrics);
        }
        std::future::pending().await
    }

    async fn run_queue(&self, mut params: QueueParams) -> DistributionResult<()> {
        while let Some(item) = params.relocations.recv().await {
            self.collected.lock().await.push(item);
        }
        std::future::pending().await
    }

    fn tenant_cache(&self) -> Option<Arc<dyn TenantCache>> {
        self.tenant_cache
            .lock()
            .expect("tenant cache lock poisoned")
            .clone()
    }
}

/// Fixed-answer tenant cache.
pub struct MockTenantCache {
    tenants: Vec<TenantName>,
}

impl MockTenantCache {
    pub fn new(tenants: Vec<TenantName>) -> Self {
        Self { tenants }
    }
}

#[async_trait]
impl TenantCache for MockTenantCache {
    async fn monitor(&self) -> DistributionResult<()> {
        std::future::pending().await
    }

    async fn tenants_over_quota(&self) -> Vec<TenantName> {
        self.tenants.clone()
    }
}
