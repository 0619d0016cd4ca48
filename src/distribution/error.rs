//! Error types for the distribution control core.
//!
//! # Error Handling Patterns
//!
//! The control core uses two patterns based on where an error lands:
//!
//! ## Restart (Supervision Loop)
//!
//! Failures of the steady-state graph land in the main supervision loop,
//! which classifies them with [`DistributionError::is_normal_distributor_error`]:
//! a *normal* error tears the graph down and rebuilds it from persisted
//! metadata; anything else is fatal and propagates to the embedder.
//!
//! ## Absorb (Audit Children)
//!
//! A failure inside one audit child must not cancel its siblings. Children
//! record findings (`audit_storage_error`) and failures on the shared
//! supervisor flags and return success; the supervisor converts the flags
//! into a single retry after all children have finished.
//!
//! # Cancellation
//!
//! [`DistributionError::Cancelled`] is never absorbed: every layer performs
//! its synchronous cleanup and rethrows, so that an incarnation that loses
//! its fencing lock cannot keep mutating shared state.

use thiserror::Error;

/// Result type for control-core operations.
pub type DistributionResult<T> = Result<T, DistributionError>;

/// Errors that can occur in the distribution control core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistributionError {
    /// Another distributor took the move-keys lock and fenced this one out.
    #[error("move-keys lock taken by another distributor")]
    MoveKeysConflict,

    /// The distribution configuration changed; the graph must be rebuilt.
    #[error("distribution configuration changed")]
    ConfigChanged,

    /// An in-flight data move was cancelled under us.
    #[error("data move cancelled")]
    DataMoveCancelled,

    /// The destination team of a data move no longer exists.
    #[error("data move destination team not found")]
    DataMoveDestTeamNotFound,

    /// A reply channel was dropped before a reply was sent.
    #[error("reply channel dropped before a reply was sent")]
    BrokenPromise,

    /// This worker was removed from the cluster.
    #[error("worker removed from cluster")]
    WorkerRemoved,

    /// The process asked to be rebooted.
    #[error("process reboot requested")]
    PleaseReboot,

    /// The owning task was cancelled.
    #[error("task cancelled")]
    Cancelled,

    /// The operation exceeded its deadline.
    #[error("operation timed out")]
    TimedOut,

    /// The requested operation is not implemented.
    #[error("operation not implemented")]
    NotImplemented,

    /// Generic failure with no more specific classification.
    #[error("operation failed")]
    OperationFailed,

    /// A request may or may not have been delivered; safe to retry with the
    /// same idempotency key.
    #[error("request delivery uncertain")]
    RequestMaybeDelivered,

    /// An audit found a storage inconsistency. A finding, not a failure:
    /// the per-range result is final and is not retried.
    #[error("audit found a storage inconsistency")]
    AuditStorageError,

    /// The audit supervisor gave up after exhausting its retries.
    #[error("audit gave up after retries")]
    AuditStorageFailed,

    /// An audit of this type is already running with a different range.
    #[error("an audit of this type is already running")]
    AuditExceededRequestLimit,

    /// Internal marker raised by the audit supervisor to request one more
    /// run after a child failed; never escapes the supervisor.
    #[error("audit retry requested")]
    Retry,

    /// Too many storage servers failed to snapshot.
    #[error("storage snapshot failed on too many servers")]
    SnapStorageFailed,

    /// A transaction log failed to snapshot.
    #[error("tlog snapshot failed")]
    SnapTLogFailed,

    /// Too many coordinators failed to snapshot.
    #[error("coordinator snapshot failed")]
    SnapCoordFailed,

    /// Could not disable tlog popping on every local tlog.
    #[error("failed to disable tlog pop")]
    SnapDisableTLogPopFailed,

    /// Could not re-enable tlog popping.
    #[error("failed to re-enable tlog pop")]
    SnapEnableTLogPopFailed,

    /// Cluster recovery started while a snapshot was in flight.
    #[error("snapshot aborted by cluster recovery")]
    SnapWithRecoveryUnsupported,

    /// A newer request with the same snapshot UID superseded this one.
    #[error("duplicate snapshot request superseded this one")]
    DuplicateSnapshotRequest,

    /// The transactional metadata store failed.
    #[error("metadata store error: {0}")]
    Txn(String),

    /// A bug: invariant violation inside the control core.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DistributionError {
    /// True if this error is the cancellation signal. Cancellation is never
    /// absorbed; callers may only perform synchronous cleanup and rethrow.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DistributionError::Cancelled)
    }

    /// Errors the tracker and the relocation queue are expected to raise
    /// during normal in-flight churn.
    #[inline]
    pub fn is_normal_queue_error(&self) -> bool {
        matches!(
            self,
            DistributionError::MoveKeysConflict
                | DistributionError::BrokenPromise
                | DistributionError::DataMoveCancelled
                | DistributionError::DataMoveDestTeamNotFound
        )
    }

    /// Errors the supervision loop recovers from by rebuilding the graph.
    /// Anything outside this set is fatal and crashes the distributor (an
    /// external supervisor restarts it).
    #[inline]
    pub fn is_normal_distributor_error(&self) -> bool {
        matches!(
            self,
            DistributionError::WorkerRemoved
                | DistributionError::BrokenPromise
                | DistributionError::Cancelled
                | DistributionError::PleaseReboot
                | DistributionError::MoveKeysConflict
                | DistributionError::DataMoveCancelled
                | DistributionError::DataMoveDestTeamNotFound
                | DistributionError::ConfigChanged
                | DistributionError::AuditStorageFailed
        )
    }

    /// True for errors of the snapshot protocol that require the orchestrator
    /// to re-enable tlog popping before propagating.
    #[inline]
    pub fn requires_tlog_pop_reenable(&self) -> bool {
        matches!(
            self,
            DistributionError::SnapStorageFailed
                | DistributionError::SnapTLogFailed
                | DistributionError::Cancelled
                | DistributionError::SnapDisableTLogPopFailed
        )
    }
}
