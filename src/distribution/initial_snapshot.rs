//! The immutable bootstrap snapshot.
//!
//! [`InitialDataDistribution`] is read in one transaction during bootstrap
//! and replayed into live state by the distributor; it may be released once
//! replay completes. [`DataMove`] carries the validation rules that decide
//! whether an in-flight move found on disk is preserved or undone.

use serde::{Deserialize, Serialize};
use tracing::error;

use super::audit::AuditState;
use super::config::UserRangeConfig;
use crate::types::{DataMoveId, Key, KeyRange, ServerId, ANONYMOUS_DATA_MOVE};

/// Whether the operator has enabled data distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionMode {
    Disabled,
    Enabled,
}

/// One shard as of the bootstrap read version.
///
/// `key` is the shard's begin; its end is the next entry's `key`. The
/// snapshot's shard vector therefore always ends with a boundary sentinel at
/// the end of the keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub key: Key,
    /// Servers holding the current primary replicas.
    pub primary_src: Vec<ServerId>,
    /// Remote-region replicas; empty in single-region mode.
    pub remote_src: Vec<ServerId>,
    /// Target primary team if a move is in flight.
    pub primary_dest: Vec<ServerId>,
    /// Target remote team if a move is in flight.
    pub remote_dest: Vec<ServerId>,
    pub src_id: DataMoveId,
    pub dest_id: DataMoveId,
    pub has_dest: bool,
}

impl ShardInfo {
    /// A shard with sources but no in-flight destination.
    pub fn new(key: Key, primary_src: Vec<ServerId>) -> Self {
        Self {
            key,
            primary_src,
            remote_src: Vec::new(),
            primary_dest: Vec::new(),
            remote_dest: Vec::new(),
            src_id: ANONYMOUS_DATA_MOVE,
            dest_id: ANONYMOUS_DATA_MOVE,
            has_dest: false,
        }
    }

    /// The terminal boundary sentinel closing the shard vector.
    pub fn boundary(key: Key) -> Self {
        Self::new(key, Vec::new())
    }
}

/// Persisted metadata of an in-flight relocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMoveMeta {
    pub id: DataMoveId,
    /// One or more ranges; more than one during a merge.
    pub ranges: Vec<KeyRange>,
}

/// An in-flight relocation reconstructed at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMove {
    pub meta: DataMoveMeta,
    pub primary_dest: Vec<ServerId>,
    pub remote_dest: Vec<ServerId>,
    /// Persisted and well-formed.
    pub valid: bool,
    /// Marked to be undone by the queue.
    pub cancelled: bool,
}

impl DataMove {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Check one shard inside this move's ranges against the move's
    /// destination metadata. Any disagreement marks the move cancelled so
    /// the queue undoes it instead of finishing it.
    pub fn validate_shard(&mut self, shard: &ShardInfo, range: &KeyRange) {
        if !self.valid {
            if shard.has_dest && shard.dest_id != ANONYMOUS_DATA_MOVE {
                error!(
                    range = %range,
                    shard_primary_dest = ?shard.primary_dest,
                    shard_remote_dest = ?shard.remote_dest,
                    reason = "DataMoveMissing",
                    "DataMoveValidationError"
                );
            }
            return;
        }

        assert!(
            !self.meta.ranges.is_empty() && self.meta.ranges[0].contains_range(range),
            "validated shard must lie inside the move's first range"
        );

        if !shard.has_dest {
            error!(
                range = %range,
                move_id = %self.meta.id,
                move_primary_dest = ?self.primary_dest,
                move_remote_dest = ?self.remote_dest,
                reason = "ShardMissingDest",
                "DataMoveValidationError"
            );
            self.cancelled = true;
            return;
        }

        if shard.dest_id != self.meta.id {
            error!(
                range = %range,
                move_id = %self.meta.id,
                shard_move_id = %shard.dest_id,
                reason = "DataMoveIdMismatch",
                "DataMoveValidationError"
            );
            self.cancelled = true;
            return;
        }

        let primary_ok = shard
            .primary_dest
            .iter()
            .all(|s| self.primary_dest.contains(s));
        let remote_ok = shard.remote_dest.iter().all(|s| self.remote_dest.contains(s));
        if !primary_ok || !remote_ok {
            error!(
                range = %range,
                move_id = %self.meta.id,
                move_primary_dest = ?self.primary_dest,
                move_remote_dest = ?self.remote_dest,
                shard_primary_dest = ?shard.primary_dest,
                shard_remote_dest = ?shard.remote_dest,
                reason = "DataMoveDestMismatch",
                "DataMoveValidationError"
            );
            self.cancelled = true;
        }
    }
}

/// Atomic snapshot of shards, data moves, and audit states as of one read
/// version. Lives until bootstrap replay completes.
#[derive(Debug, Clone)]
pub struct InitialDataDistribution {
    pub mode: DistributionMode,
    /// Shards in key order, closed by a boundary sentinel at the end of the
    /// keyspace.
    pub shards: Vec<ShardInfo>,
    pub data_moves: Vec<DataMove>,
    pub audit_states: Vec<AuditState>,
    pub user_range_config: UserRangeConfig,
    /// Completed moves whose tombstones may be garbage-collected.
    pub to_clean_tombstones: Vec<DataMoveId>,
}

impl InitialDataDistribution {
    /// Check every shard inside each valid move's ranges against the move's
    /// destination metadata; disagreements mark the move cancelled. Run once
    /// when the snapshot is read.
    pub fn validate_data_moves(&mut self) {
        let shards = &self.shards;
        for data_move in &mut self.data_moves {
            if data_move.meta.ranges.is_empty() {
                continue;
            }
            let covering = data_move.meta.ranges[0].clone();
            for window in shards.windows(2) {
                let shard = &window[0];
                let range = KeyRange::new(shard.key.clone(), window[1].key.clone());
                if covering.contains_range(&range) {
                    data_move.validate_shard(shard, &range);
                }
            }
        }
    }

    pub fn empty(mode: DistributionMode) -> Self {
        Self {
            mode,
            shards: vec![ShardInfo::boundary(crate::types::max_key())],
            data_moves: Vec::new(),
            audit_states: Vec::new(),
            user_range_config: UserRangeConfig::new(),
            to_clean_tombstones: Vec::new(),
        }
    }
}
