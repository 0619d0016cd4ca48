//! The admin request surface.
//!
//! [`DataDistributor::serve`] multiplexes inbound administrative requests
//! over the running supervision loop: halting, metric queries, cluster
//! snapshots (with UID-keyed deduplication and result replay), exclusion
//! safety checks, wiggler state queries, audit triggers, storage-quota
//! queries, and the blob-restore handshake.
//!
//! Every request is answered with either a typed success or a single typed
//! error; a halted distributor drops its pending reply channels, which wakes
//! every caller with `broken_promise`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::distributor::DataDistributor;
use super::error::{DistributionError, DistributionResult};
use super::external::{ComponentFactory, ShardMetricsRequest, WigglerStateSnapshot};
use super::audit::AuditType;
use super::snapshot::SnapshotRequest;
use super::tasks::TaskGroup;
use crate::types::{
    is_blob_migrator, AddressExclusion, AuditId, KeyRange, ServerId, ShardMetric, SnapshotId,
    StorageServerInfo, TenantName,
};

/// Reply to a metrics request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsReply {
    /// Per-shard metrics, up to the requested limit.
    List(Vec<ShardMetric>),
    /// Median shard size over the requested range.
    MidShardSize(u64),
}

/// Reply to an exclusion safety check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExclusionSafetyReply {
    pub safe: bool,
}

/// Reply to a wiggler state query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WigglerStateReply {
    pub primary: Option<WigglerStateSnapshot>,
    pub remote: Option<WigglerStateSnapshot>,
}

/// Outcome of a blob-restore handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobRestoreOutcome {
    Success,
    /// Another blob restore is already preparing.
    ConflictBlobRestore,
    /// A snapshot currently suspends movement.
    ConflictSnapshot,
}

/// A blob-restore handshake request, honoured only from the blob migrator.
#[derive(Debug)]
pub struct PrepareBlobRestoreRequest {
    pub ssi: StorageServerInfo,
    pub keys: KeyRange,
    pub requester: ServerId,
    pub reply: oneshot::Sender<DistributionResult<BlobRestoreOutcome>>,
}

/// An administrative request to the distributor.
#[derive(Debug)]
pub enum DistributorRequest {
    /// Terminate the distributor.
    Halt {
        requester: ServerId,
        reply: oneshot::Sender<()>,
    },
    /// Shard metrics over a range; `mid_only` reduces to the median size.
    Metrics {
        keys: KeyRange,
        shard_limit: usize,
        mid_only: bool,
        reply: oneshot::Sender<DistributionResult<MetricsReply>>,
    },
    /// Crash-consistent cluster snapshot, deduplicated by `snap_id`.
    Snapshot {
        payload: Bytes,
        snap_id: SnapshotId,
        reply: oneshot::Sender<DistributionResult<()>>,
    },
    /// Whether excluding the given addresses is safe.
    ExclusionSafetyCheck {
        exclusions: Vec<AddressExclusion>,
        reply: oneshot::Sender<ExclusionSafetyReply>,
    },
    /// Current wiggler state per region.
    WigglerState {
        reply: oneshot::Sender<WigglerStateReply>,
    },
    /// Start (or join) a consistency audit.
    TriggerAudit {
        audit_type: AuditType,
        range: KeyRange,
        reply: oneshot::Sender<DistributionResult<AuditId>>,
    },
    /// Tenants currently over their storage quota.
    TenantsOverQuota {
        reply: oneshot::Sender<Vec<TenantName>>,
    },
    /// Blob-restore handshake.
    PrepareBlobRestore(PrepareBlobRestoreRequest),
}

struct InflightSnap {
    payload: Bytes,
    reply: oneshot::Sender<DistributionResult<()>>,
}

/// Deduplication book for snapshot requests: in-flight requests keyed by
/// UID, plus finished results replayed for a retention window.
#[derive(Default)]
struct SnapBook {
    inflight: Mutex<HashMap<SnapshotId, InflightSnap>>,
    results: DashMap<SnapshotId, DistributionResult<()>>,
}

fn median_shard_size(mut metrics: Vec<ShardMetric>) -> u64 {
    if metrics.is_empty() {
        return 0;
    }
    let mid = metrics.len() / 2;
    let (_, median, _) = metrics.select_nth_unstable_by_key(mid, |m| m.shard_bytes);
    median.shard_bytes
}

impl DataDistributor {
    /// Run the distributor and serve admin requests until halted or a fatal
    /// error occurs. Normal termination (a halt, or a recoverable error
    /// escalating through a disabled cluster) resolves `Ok`.
    pub async fn serve(
        self: Arc<Self>,
        factory: Arc<dyn ComponentFactory>,
        mut requests: mpsc::Receiver<DistributorRequest>,
    ) -> DistributionResult<()> {
        info!(distributor_id = %self.id, "data distributor running");
        let snap_book = Arc::new(SnapBook::default());
        let handlers = TaskGroup::new();
        let mut distributor = tokio::spawn(Arc::clone(&self).run(factory));

        let result = loop {
            tokio::select! {
                joined = &mut distributor => {
                    let outcome = match joined {
                        Ok(res) => res,
                        Err(join_err) if join_err.is_cancelled() => Err(DistributionError::Cancelled),
                        Err(join_err) => Err(DistributionError::Internal(format!(
                            "distribution loop panicked: {join_err}"
                        ))),
                    };
                    match outcome {
                        Ok(()) => {
                            break Err(DistributionError::Internal(
                                "distribution loop exited without an error".to_string(),
                            ));
                        }
                        Err(e) if e.is_normal_distributor_error() => {
                            info!(distributor_id = %self.id, error = %e, "data distributor stopped");
                            break Ok(());
                        }
                        Err(e) => {
                            warn!(distributor_id = %self.id, error = %e, "data distributor failed");
                            break Err(e);
                        }
                    }
                }
                request = requests.recv() => {
                    let Some(request) = request else {
                        info!(distributor_id = %self.id, "request channel closed");
                        break Ok(());
                    };
                    if let DistributorRequest::Halt { requester, reply } = request {
                        let _ = reply.send(());
                        info!(distributor_id = %self.id, requester = %requester, "data distributor halted");
                        break Ok(());
                    }
                    self.dispatch(request, &snap_book, &handlers);
                }
            }
        };

        distributor.abort();
        handlers.cancel_all();
        self.background.cancel_all();
        self.cancel_all_audits();
        result
    }

    fn dispatch(
        self: &Arc<Self>,
        request: DistributorRequest,
        snap_book: &Arc<SnapBook>,
        handlers: &TaskGroup,
    ) {
        match request {
            DistributorRequest::Halt { .. } => unreachable!("halt is handled by the serve loop"),
            DistributorRequest::Metrics {
                keys,
                shard_limit,
                mid_only,
                reply,
            } => {
                let this = Arc::clone(self);
                handlers.add(async move {
                    let _ = reply.send(this.handle_metrics(keys, shard_limit, mid_only).await);
                    Ok(())
                });
            }
            DistributorRequest::Snapshot {
                payload,
                snap_id,
                reply,
            } => self.handle_snapshot(payload, snap_id, reply, snap_book, handlers),
            DistributorRequest::ExclusionSafetyCheck { exclusions, reply } => {
                let this = Arc::clone(self);
                handlers.add(async move {
                    let _ = reply.send(this.handle_exclusion_safety_check(exclusions).await);
                    Ok(())
                });
            }
            DistributorRequest::WigglerState { reply } => {
                let this = Arc::clone(self);
                handlers.add(async move {
                    let _ = reply.send(this.handle_wiggler_state().await);
                    Ok(())
                });
            }
            DistributorRequest::TriggerAudit {
                audit_type,
                range,
                reply,
            } => {
                let this = Arc::clone(self);
                handlers.add(async move {
                    let _ = reply.send(this.handle_trigger_audit(audit_type, range).await);
                    Ok(())
                });
            }
            DistributorRequest::TenantsOverQuota { reply } => {
                let this = Arc::clone(self);
                handlers.add(async move {
                    let tenants = match this.tenant_cache() {
                        Some(cache) => cache.tenants_over_quota().await,
                        None => Vec::new(),
                    };
                    let _ = reply.send(tenants);
                    Ok(())
                });
            }
            DistributorRequest::PrepareBlobRestore(request) => {
                match self.blob_restore_tx() {
                    Some(tx) => {
                        if let Err(send_err) = tx.send(request) {
                            let _ = send_err.0.reply.send(Err(DistributionError::BrokenPromise));
                        }
                    }
                    None => {
                        let _ = request.reply.send(Err(DistributionError::BrokenPromise));
                    }
                }
            }
        }
    }

    async fn handle_metrics(
        self: &Arc<Self>,
        keys: KeyRange,
        shard_limit: usize,
        mid_only: bool,
    ) -> DistributionResult<MetricsReply> {
        let tx = self
            .shard_metrics_tx()
            .ok_or(DistributionError::BrokenPromise)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(ShardMetricsRequest {
            keys,
            shard_limit,
            reply: reply_tx,
        })
        .map_err(|_| DistributionError::BrokenPromise)?;
        let metrics = reply_rx
            .await
            .map_err(|_| DistributionError::BrokenPromise)?;
        if mid_only {
            Ok(MetricsReply::MidShardSize(median_shard_size(metrics)))
        } else {
            Ok(MetricsReply::List(metrics))
        }
    }

    async fn handle_exclusion_safety_check(
        self: &Arc<Self>,
        exclusions: Vec<AddressExclusion>,
    ) -> ExclusionSafetyReply {
        debug!(distributor_id = %self.id, exclusions = exclusions.len(), "exclusion safety check");
        let (primary, _) = self.team_collections();
        let Some(collection) = primary else {
            info!(distributor_id = %self.id, "exclusion check: no team collection yet");
            return ExclusionSafetyReply { safe: false };
        };
        // With one team or fewer, excluding anything can stall team building.
        if collection.team_count().await <= 1 {
            info!(distributor_id = %self.id, "exclusion check: not enough teams");
            return ExclusionSafetyReply { safe: false };
        }
        let servers = match self.txn.get_server_list().await {
            Ok(servers) => servers,
            Err(e) => {
                warn!(distributor_id = %self.id, error = %e, "exclusion check: server list unavailable");
                return ExclusionSafetyReply { safe: false };
            }
        };
        let mut exclude_ids: Vec<ServerId> = Vec::new();
        for exclusion in &exclusions {
            for server in &servers {
                let secondary_hit = server
                    .secondary_address
                    .as_ref()
                    .map(|a| exclusion.excludes(a))
                    .unwrap_or(false);
                if exclusion.excludes(&server.address) || secondary_hit {
                    exclude_ids.push(server.id);
                }
            }
        }
        let safe = collection.exclusion_safety_check(&exclude_ids).await;
        debug!(distributor_id = %self.id, safe, "exclusion safety check finished");
        ExclusionSafetyReply { safe }
    }

    async fn handle_wiggler_state(self: &Arc<Self>) -> WigglerStateReply {
        let (primary, remote) = self.team_collections();
        let primary_state = match primary {
            Some(c) => Some(c.wiggler_state().await),
            None => None,
        };
        let remote_state = match remote {
            Some(c) => Some(c.wiggler_state().await),
            None => None,
        };
        WigglerStateReply {
            primary: primary_state,
            remote: remote_state,
        }
    }

    fn handle_snapshot(
        self: &Arc<Self>,
        payload: Bytes,
        snap_id: SnapshotId,
        reply: oneshot::Sender<DistributionResult<()>>,
        snap_book: &Arc<SnapBook>,
        handlers: &TaskGroup,
    ) {
        // A finished request within the retention window replays its result.
        if let Some(result) = snap_book.results.get(&snap_id) {
            info!(snap_id = %snap_id, "replaying finished snapshot result");
            let _ = reply.send(result.clone());
            return;
        }

        let mut inflight = snap_book.inflight.lock().expect("snap book lock poisoned");
        if let Some(existing) = inflight.get_mut(&snap_id) {
            // At-least-once senders retry; the newest reply channel wins and
            // the superseded caller learns why.
            info!(snap_id = %snap_id, "duplicate in-flight snapshot request");
            if existing.payload != payload {
                warn!(snap_id = %snap_id, "duplicate snapshot request with different payload");
            }
            let superseded = std::mem::replace(
                existing,
                InflightSnap { payload, reply },
            );
            let _ = superseded
                .reply
                .send(Err(DistributionError::DuplicateSnapshotRequest));
            return;
        }
        inflight.insert(
            snap_id,
            InflightSnap {
                payload: payload.clone(),
                reply,
            },
        );
        drop(inflight);

        let this = Arc::clone(self);
        let book = Arc::clone(snap_book);
        handlers.add(async move {
            let outcome = this.snap_create(SnapshotRequest { payload, snap_id }).await;
            if outcome == Err(DistributionError::Cancelled) {
                // No reply: the caller observes a broken promise.
                return Err(DistributionError::Cancelled);
            }
            if let Some(inflight) = book
                .inflight
                .lock()
                .expect("snap book lock poisoned")
                .remove(&snap_id)
            {
                let _ = inflight.reply.send(outcome.clone());
            }
            book.results.insert(snap_id, outcome);
            tokio::time::sleep(this.knobs.snap_minimum_time_gap).await;
            book.results.remove(&snap_id);
            Ok(())
        });
    }

    /// Serve blob-migrator handshakes for one graph round. A successful
    /// preparation tears the tracker and queue down by raising a
    /// configuration change, which rebuilds the graph.
    pub(crate) async fn serve_blob_restore_requests(
        self: Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<PrepareBlobRestoreRequest>,
    ) -> DistributionResult<()> {
        self.initialized_signal().wait().await;
        while let Some(request) = requests.recv().await {
            if !is_blob_migrator(&request.ssi.id) {
                let _ = request.reply.send(Err(DistributionError::OperationFailed));
                continue;
            }
            if self.enabled_state.same_id(request.requester)
                && self.enabled_state.is_blob_restore_preparing()
            {
                // The sender uses an at-least-once model; this is our own
                // in-flight preparation showing up again.
                debug!(requester = %request.requester, "repeated blob restore request");
                continue;
            }
            if self
                .enabled_state
                .try_set_blob_restore_preparing(request.requester)
            {
                // Preparation survives the graph teardown; the raised
                // configuration change forces the rebuild.
                let this = Arc::clone(&self);
                self.background.add(this.prepare_data_migration(request));
                return Err(DistributionError::ConfigChanged);
            } else {
                let outcome = if self.enabled_state.is_blob_restore_preparing() {
                    BlobRestoreOutcome::ConflictBlobRestore
                } else {
                    BlobRestoreOutcome::ConflictSnapshot
                };
                let _ = request.reply.send(Ok(outcome));
            }
        }
        Ok(())
    }

    /// Register the migrator as a storage server and persist the restore
    /// marker, then release the enablement slot.
    async fn prepare_data_migration(
        self: Arc<Self>,
        request: PrepareBlobRestoreRequest,
    ) -> DistributionResult<()> {
        let result: DistributionResult<()> = async {
            self.txn.add_storage_server(request.ssi.clone()).await?;
            self.txn
                .prepare_blob_restore(
                    self.lock(),
                    request.keys.clone(),
                    request.ssi.id,
                    request.requester,
                )
                .await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                info!(requester = %request.requester, "blob restore prepared");
                let _ = request.reply.send(Ok(BlobRestoreOutcome::Success));
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(requester = %request.requester, error = %e, "blob restore preparation failed");
                let _ = request.reply.send(Err(e));
            }
        }
        assert!(
            self.enabled_state.try_set_enabled(request.requester),
            "blob restore slot release must succeed"
        );
        Ok(())
    }
}
