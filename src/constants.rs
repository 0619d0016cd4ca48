//! Centralized tunables and protocol constants.
//!
//! This module consolidates all magic numbers used throughout the distributor.
//! Having them in one place makes it easier to:
//!
//! - Understand the control-loop constraints
//! - Update values consistently
//! - Document the rationale for each constant
//!
//! # Categories
//!
//! - **Relocation Priorities**: ordering of queued data movements
//! - **Movement Constants**: bootstrap replay and shard placement limits
//! - **Wiggle Constants**: rolling storage replacement pacing
//! - **Audit Constants**: consistency audit retry and pacing
//! - **Snapshot Constants**: cluster snapshot fault budgets and timeouts

use std::time::Duration;

// =============================================================================
// Relocation Priorities
// =============================================================================
//
// Larger is more urgent. The queue drains strictly by priority; the spacing
// between values leaves room for the queue to interleave derived priorities
// (e.g. boosting a stalled move by one).

/// Replay of a move that was in flight when the previous distributor died.
pub const PRIORITY_RECOVER_MOVE: i32 = 110;

/// Move sourced from an underutilized team during load rebalancing.
pub const PRIORITY_REBALANCE_UNDERUTILIZED_TEAM: i32 = 120;

/// Move sourced from an overutilized team during load rebalancing.
pub const PRIORITY_REBALANCE_OVERUTILIZED_TEAM: i32 = 121;

/// Routine move between healthy teams.
pub const PRIORITY_TEAM_HEALTHY: i32 = 140;

/// Source team contains a server marked undesired (excluded or wiggling).
pub const PRIORITY_TEAM_CONTAINS_UNDESIRED_SERVER: i32 = 150;

/// Source team is redundant and should be drained.
pub const PRIORITY_TEAM_REDUNDANT: i32 = 200;

/// Merge of adjacent small shards.
pub const PRIORITY_MERGE_SHARD: i32 = 340;

/// Source team is unhealthy (wrong replica count).
pub const PRIORITY_TEAM_UNHEALTHY: i32 = 700;

/// Source team has only two live replicas left.
pub const PRIORITY_TEAM_2_LEFT: i32 = 709;

/// Source team has only one live replica left.
pub const PRIORITY_TEAM_1_LEFT: i32 = 800;

/// Source team has zero live replicas.
pub const PRIORITY_TEAM_0_LEFT: i32 = 809;

/// Split of an oversized or hot shard.
pub const PRIORITY_SPLIT_SHARD: i32 = 950;

// =============================================================================
// Movement Constants
// =============================================================================

/// Maximum number of shard moves the metadata layer commits in parallel.
///
/// Bounds the number of `recover_move` relocations the bootstrap replay can
/// find in flight: the previous incarnation never had more than this many
/// uncommitted destinations.
pub const DD_MOVE_KEYS_PARALLELISM: usize = 15;

/// Number of over-replicated shards tolerated before they are treated as
/// unhealthy during bootstrap replay. Zero disables large-team handling
/// entirely (no split-fragment or unhealthy relocations are emitted for
/// merely over-replicated shards).
pub const DD_MAX_SHARDS_ON_LARGE_TEAMS: usize = 100;

// =============================================================================
// Wiggle Constants
// =============================================================================

/// Minimum age of a storage server before a routine (non-forced) wiggle is
/// considered necessary. Wrongly-configured servers bypass this.
pub const DD_STORAGE_WIGGLE_MIN_SS_AGE: Duration = Duration::from_secs(600);

/// Pause between eligibility checks when the wiggle queue yields nothing.
pub const WIGGLE_MIN_ON_CHECK_DELAY: Duration = Duration::from_secs(5);

// =============================================================================
// Audit Constants
// =============================================================================

/// Maximum supervisor-level retries before an audit is persisted as `Failed`.
pub const AUDIT_RETRY_COUNT_MAX: u32 = 30;

/// Pause before a failed audit run is relaunched.
pub const AUDIT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Pause between progress-iteration batches so a large keyspace walk does not
/// monopolize the scheduler.
pub const AUDIT_DISPATCH_PAUSE: Duration = Duration::from_millis(100);

/// Sustained-failure window for the per-server audit RPC. A storage server
/// that does not reply within this window fails the child task.
pub const AUDIT_SS_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll interval when waiting for an audit to leave the supervisor table.
pub const AUDIT_WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Snapshot Constants
// =============================================================================

/// Upper bound on storage snapshot replies that may fail before the snapshot
/// aborts. The effective budget is further reduced by the replication factor
/// and by already-failed storage servers.
pub const MAX_STORAGE_SNAPSHOT_FAULT_TOLERANCE: usize = 1;

/// Upper bound on coordinator snapshot replies that may fail.
pub const MAX_COORDINATOR_SNAPSHOT_FAULT_TOLERANCE: usize = 1;

/// Per-node retry budget for snapshot requests lost in the network.
pub const SNAP_NETWORK_FAILURE_RETRY_LIMIT: u32 = 10;

/// Whole-snapshot deadline. On expiry the requester gets `timed_out` and the
/// in-flight entry is erased.
pub const SNAP_CREATE_MAX_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a finished snapshot result is retained so that duplicate
/// requests with the same UID replay the stored reply.
pub const SNAP_MINIMUM_TIME_GAP: Duration = Duration::from_secs(10);

/// Initial backoff for retrying a possibly-delivered snapshot request;
/// doubles on every retry.
pub const PREVENT_FAST_SPIN_DELAY: Duration = Duration::from_millis(100);

// =============================================================================
// Scheduling Constants
// =============================================================================

/// Depth of the bounded relocation consumer channel. The yielding bridge
/// between producer and consumer blocks once the queue has this many
/// undelivered items, bounding memory during bootstrap replay storms.
pub const RELOCATION_CONSUMER_DEPTH: usize = 1024;

/// Interval of the physical-shard status monitor.
pub const PHYSICAL_SHARD_METRICS_DELAY: Duration = Duration::from_secs(300);

/// Pause between bootstrap attempts while the operator mode is disabled or
/// an exclusive operation is suspending movement.
pub const INIT_RETRY_DELAY: Duration = Duration::from_secs(1);
