//! The crash-consistent cluster snapshot orchestrator.
//!
//! A snapshot captures every stateful role with a fault-tolerance budget,
//! in a mandatory order: storages first (while tlog popping is disabled, so
//! their on-disk state is not overtaken), then tlogs, then — after popping
//! is re-enabled — coordinators. A durable "write recovery" flag brackets
//! the whole protocol so a crash mid-snapshot is detectable.
//!
//! On any failure between disabling and re-enabling tlog popping, the
//! orchestrator re-enables popping best-effort before propagating: a failed
//! snapshot must never leave the cluster's logs frozen.

use std::sync::Arc;

use backon::Retryable;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use super::distributor::DataDistributor;
use super::error::{DistributionError, DistributionResult};
use super::external::StatefulWorkers;
use super::retry::{snap_request_policy, txn_policy};
use crate::types::{ServerId, SnapshotId};

/// An incoming snapshot request.
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub payload: Bytes,
    pub snap_id: SnapshotId,
}

/// Resolve once at least `futures.len() - fault_tolerance` of the futures
/// succeed; fail with `error` as soon as more than `fault_tolerance` have
/// failed. Individual errors are logged, not propagated.
pub async fn wait_for_most<I, F>(
    futures: I,
    fault_tolerance: usize,
    error: DistributionError,
) -> DistributionResult<()>
where
    I: IntoIterator<Item = F>,
    F: std::future::Future<Output = DistributionResult<()>>,
{
    let mut running: FuturesUnordered<F> = futures.into_iter().collect();
    let mut failures = 0usize;
    while let Some(result) = running.next().await {
        if let Err(e) = result {
            if e.is_cancelled() {
                return Err(e);
            }
            failures += 1;
            debug!(error = %e, failures, fault_tolerance, "snapshot participant failed");
            if failures > fault_tolerance {
                return Err(error);
            }
        }
    }
    Ok(())
}

impl DataDistributor {
    /// Send one snapshot request to a worker, retrying deliveries lost in
    /// the network with the same snapshot id (the receiver deduplicates).
    async fn try_snap_worker(
        &self,
        worker: ServerId,
        payload: &Bytes,
        snap_id: SnapshotId,
        role: &'static str,
    ) -> DistributionResult<()> {
        let transport = Arc::clone(&self.snapshot_transport);
        (|| async { transport.snap_worker(worker, payload, snap_id, role).await })
            .retry(snap_request_policy(
                self.knobs.snap_network_failure_retry_limit,
            ))
            .when(|e| matches!(e, DistributionError::RequestMaybeDelivered))
            .notify(|e, _| {
                debug!(worker = %worker, role, error = %e, "retrying snapshot request");
            })
            .await
    }

    /// Re-enable tlog popping on every local tlog, swallowing failures.
    async fn reenable_tlog_pops_best_effort(&self, snap_id: SnapshotId) {
        let tlogs = match self.snapshot_transport.local_tlogs().await {
            Ok(tlogs) => tlogs,
            Err(e) => {
                debug!(error = %e, "could not enumerate tlogs for pop re-enable");
                return;
            }
        };
        for tlog in tlogs {
            if let Err(e) = self.snapshot_transport.enable_tlog_pop(tlog, snap_id).await {
                debug!(tlog = %tlog, error = %e, "ignoring tlog pop re-enable failure");
            }
        }
    }

    /// The snapshot protocol proper. Steps are strictly sequenced; see the
    /// module docs for the ordering rationale.
    pub(crate) async fn snap_create_core(
        self: &Arc<Self>,
        request: &SnapshotRequest,
    ) -> DistributionResult<()> {
        let snap_id = request.snap_id;

        // 1. Durable "snapshot in progress" flag.
        let txn = Arc::clone(&self.txn);
        (|| async { txn.set_write_recovery_flag(true).await })
            .retry(txn_policy())
            .when(|e| matches!(e, DistributionError::Txn(_)))
            .await?;
        info!(snap_id = %snap_id, "snapshot started");

        let body: DistributionResult<()> = async {
            // 2. Freeze tlog popping everywhere; all must succeed.
            let tlogs = self.snapshot_transport.local_tlogs().await.map_err(|e| {
                warn!(snap_id = %snap_id, error = %e, "tlog enumeration failed");
                DistributionError::SnapDisableTLogPopFailed
            })?;
            futures::future::try_join_all(tlogs.iter().map(|tlog| {
                let transport = Arc::clone(&self.snapshot_transport);
                let tlog = *tlog;
                async move {
                    transport
                        .disable_tlog_pop(tlog, snap_id)
                        .await
                        .map_err(|e| {
                            if e.is_cancelled() {
                                e
                            } else {
                                warn!(tlog = %tlog, error = %e, "disable tlog pop failed");
                                DistributionError::SnapDisableTLogPopFailed
                            }
                        })
                }
            }))
            .await?;
            info!(snap_id = %snap_id, tlogs = tlogs.len(), "tlog popping disabled");

            // 3. Enumerate stateful workers and compute the storage budget.
            let workers: StatefulWorkers =
                self.snapshot_transport.stateful_workers().await.map_err(|e| {
                    if e.is_cancelled() {
                        e
                    } else {
                        warn!(snap_id = %snap_id, error = %e, "stateful worker enumeration failed");
                        DistributionError::SnapStorageFailed
                    }
                })?;
            let configuration = self.configuration();
            let budget = self
                .knobs
                .max_storage_snapshot_fault_tolerance
                .min(configuration.storage_team_size.saturating_sub(1))
                as isize
                - workers.storage_failures as isize;
            if budget < 0 {
                // Too many storage servers already failed to even start.
                return Err(DistributionError::SnapStorageFailed);
            }
            let storage_fault_tolerance = budget as usize;
            info!(
                snap_id = %snap_id,
                workers = workers.workers.len(),
                storage_fault_tolerance,
                "enumerated stateful workers"
            );

            // 4. Storages first: crash consistency depends on capturing them
            // while the logs are frozen.
            wait_for_most(
                workers
                    .storages()
                    .map(|w| self.try_snap_worker(w.id, &request.payload, snap_id, "storage")),
                storage_fault_tolerance,
                DistributionError::SnapStorageFailed,
            )
            .await?;
            info!(snap_id = %snap_id, "storage snapshots done");

            // 5. TLogs, tolerating nothing.
            wait_for_most(
                workers
                    .tlogs()
                    .map(|w| self.try_snap_worker(w.id, &request.payload, snap_id, "tlog")),
                0,
                DistributionError::SnapTLogFailed,
            )
            .await?;
            info!(snap_id = %snap_id, "tlog snapshots done");

            // 6. Thaw tlog popping; all must succeed.
            futures::future::try_join_all(tlogs.iter().map(|tlog| {
                let transport = Arc::clone(&self.snapshot_transport);
                let tlog = *tlog;
                async move {
                    transport.enable_tlog_pop(tlog, snap_id).await.map_err(|e| {
                        if e.is_cancelled() {
                            e
                        } else {
                            warn!(tlog = %tlog, error = %e, "enable tlog pop failed");
                            DistributionError::SnapEnableTLogPopFailed
                        }
                    })
                }
            }))
            .await?;
            info!(snap_id = %snap_id, "tlog popping re-enabled");

            // 7. Coordinators, tolerating a minority-bounded budget.
            let coordinators: Vec<_> = workers.coordinators().collect();
            let coordinator_fault_tolerance = (coordinators.len() / 2)
                .saturating_sub(1)
                .min(self.knobs.max_coordinator_snapshot_fault_tolerance);
            wait_for_most(
                coordinators
                    .iter()
                    .map(|w| self.try_snap_worker(w.id, &request.payload, snap_id, "coord")),
                coordinator_fault_tolerance,
                DistributionError::SnapCoordFailed,
            )
            .await?;
            info!(snap_id = %snap_id, "coordinator snapshots done");

            // 8. Clear the durable flag.
            let txn = Arc::clone(&self.txn);
            (|| async { txn.set_write_recovery_flag(false).await })
                .retry(txn_policy())
                .when(|e| matches!(e, DistributionError::Txn(_)))
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = body {
            warn!(snap_id = %snap_id, error = %e, "snapshot failed");
            if e.requires_tlog_pop_reenable() {
                // A failed snapshot must never leave the logs frozen.
                self.reenable_tlog_pops_best_effort(snap_id).await;
            }
            return Err(e);
        }
        info!(snap_id = %snap_id, "snapshot complete");
        Ok(())
    }

    /// Run one snapshot under the enablement slot, the recovery watch, and
    /// the whole-snapshot timeout. Returns the outcome to be recorded in the
    /// dedup book.
    pub(crate) async fn snap_create(
        self: &Arc<Self>,
        request: SnapshotRequest,
    ) -> DistributionResult<()> {
        if !self.enabled_state.try_set_snapshot(request.snap_id) {
            // A previous exclusive operation is still holding the slot.
            info!(snap_id = %request.snap_id, "snapshot rejected: movement already suspended");
            return Err(DistributionError::OperationFailed);
        }

        let mut recovery = self.cluster_epoch.clone();
        recovery.borrow_and_update();

        let outcome = tokio::select! {
            changed = recovery.changed() => {
                match changed {
                    Ok(()) => {
                        info!(snap_id = %request.snap_id, "cluster recovery during snapshot");
                        Err(DistributionError::SnapWithRecoveryUnsupported)
                    }
                    Err(_) => std::future::pending().await,
                }
            }
            result = tokio::time::timeout(
                self.knobs.snap_create_max_timeout,
                self.snap_create_core(&request),
            ) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => {
                        info!(snap_id = %request.snap_id, "snapshot timed out");
                        Err(DistributionError::TimedOut)
                    }
                }
            }
        };

        super::metrics::snapshot_finished(match &outcome {
            Ok(()) => "success",
            Err(e) => {
                if *e == DistributionError::TimedOut {
                    "timeout"
                } else {
                    "failure"
                }
            }
        });

        // Movement resumes no matter how the snapshot ended.
        assert!(
            self.enabled_state.try_set_enabled(request.snap_id),
            "snapshot slot release must succeed"
        );
        outcome
    }

    /// Test-only: drive the snapshot protocol without the dispatcher.
    #[cfg(any(test, feature = "test-utilities"))]
    pub async fn snap_create_core_for_test(
        self: &Arc<Self>,
        request: &SnapshotRequest,
    ) -> DistributionResult<()> {
        self.snap_create_core(request).await
    }

    /// Test-only: run one gated snapshot without the dispatcher.
    #[cfg(any(test, feature = "test-utilities"))]
    pub async fn snap_create_for_test(
        self: &Arc<Self>,
        request: SnapshotRequest,
    ) -> DistributionResult<()> {
        self.snap_create(request).await
    }
}
