//! Cluster and distributor configuration.
//!
//! Two layers of configuration reach the control core:
//!
//! - [`DatabaseConfiguration`] is cluster state read from persisted metadata
//!   during bootstrap (replication factor, region layout). It can change
//!   under us; the configuration watcher tears the graph down when it does.
//! - [`DistributorConfig`] is the local tunable set ("knobs"), defaulted
//!   from [`crate::constants`] and fixed for the lifetime of the process.
//!
//! [`UserRangeConfig`] carries operator-supplied per-range overrides (custom
//! replica counts); its boundaries split shards during bootstrap replay.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{DistributionError, DistributionResult};
use crate::constants::{
    AUDIT_RETRY_COUNT_MAX, AUDIT_RETRY_DELAY, DD_MAX_SHARDS_ON_LARGE_TEAMS,
    DD_MOVE_KEYS_PARALLELISM, DD_STORAGE_WIGGLE_MIN_SS_AGE, MAX_COORDINATOR_SNAPSHOT_FAULT_TOLERANCE,
    MAX_STORAGE_SNAPSHOT_FAULT_TOLERANCE, RELOCATION_CONSUMER_DEPTH, SNAP_CREATE_MAX_TIMEOUT,
    SNAP_MINIMUM_TIME_GAP, SNAP_NETWORK_FAILURE_RETRY_LIMIT,
};
use crate::types::{DcId, Key, KeyRange};

/// One region of the cluster. The first region is the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub dc_id: DcId,
}

/// Cluster-wide replication configuration, read at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfiguration {
    /// Number of replicas each shard keeps in one region.
    pub storage_team_size: usize,
    /// Number of regions serving reads and writes (1 or 2).
    pub usable_regions: usize,
    /// Configured regions, primary first.
    pub regions: Vec<RegionInfo>,
}

impl Default for DatabaseConfiguration {
    fn default() -> Self {
        Self {
            storage_team_size: 0,
            usable_regions: 1,
            regions: Vec::new(),
        }
    }
}

impl DatabaseConfiguration {
    pub fn single_region(storage_team_size: usize) -> Self {
        Self {
            storage_team_size,
            usable_regions: 1,
            regions: Vec::new(),
        }
    }

    pub fn multi_region(storage_team_size: usize, primary: DcId, remote: DcId) -> Self {
        Self {
            storage_team_size,
            usable_regions: 2,
            regions: vec![RegionInfo { dc_id: primary }, RegionInfo { dc_id: remote }],
        }
    }

    pub fn is_multi_region(&self) -> bool {
        self.usable_regions > 1
    }

    /// The primary datacenter ids (at most one configured today).
    pub fn primary_dc_ids(&self) -> Vec<DcId> {
        self.regions.first().map(|r| r.dc_id.clone()).into_iter().collect()
    }

    /// The remote datacenter ids (empty in single-region mode).
    pub fn remote_dc_ids(&self) -> Vec<DcId> {
        self.regions.iter().skip(1).map(|r| r.dc_id.clone()).collect()
    }

    pub fn validate(&self) -> DistributionResult<()> {
        if self.storage_team_size == 0 {
            return Err(DistributionError::Internal(
                "storage team size must be positive".to_string(),
            ));
        }
        if !(1..=2).contains(&self.usable_regions) {
            return Err(DistributionError::Internal(format!(
                "usable regions must be 1 or 2, got {}",
                self.usable_regions
            )));
        }
        if self.usable_regions > 1 && self.regions.len() < self.usable_regions {
            return Err(DistributionError::Internal(
                "multi-region configuration requires a dc id per region".to_string(),
            ));
        }
        Ok(())
    }
}

/// Operator-supplied per-range replication overrides.
///
/// Internally a boundary map over the whole keyspace: an entry at key `k`
/// holds the override in effect from `k` until the next boundary. The map
/// always has a boundary at the empty key, so lookups never miss.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRangeConfig {
    boundaries: BTreeMap<Key, Option<usize>>,
}

impl UserRangeConfig {
    pub fn new() -> Self {
        let mut boundaries = BTreeMap::new();
        boundaries.insert(Key::new(), None);
        Self { boundaries }
    }

    /// Set a replica-count override for a range, splitting existing
    /// boundaries as needed.
    pub fn set_range(&mut self, range: KeyRange, replicas: usize) {
        if range.is_empty() {
            return;
        }
        let after = self.value_at(&range.end);
        let inside: Vec<Key> = self
            .boundaries
            .range(range.begin.clone()..range.end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for k in inside {
            self.boundaries.remove(&k);
        }
        self.boundaries.insert(range.begin.clone(), Some(replicas));
        self.boundaries.insert(range.end.clone(), after);
        if self.boundaries.keys().next().map(|k| !k.is_empty()).unwrap_or(true) {
            self.boundaries.insert(Key::new(), None);
        }
    }

    /// The override in effect at `key`, if any.
    pub fn value_at(&self, key: &Key) -> Option<usize> {
        self.boundaries
            .range(..=key.clone())
            .next_back()
            .and_then(|(_, v)| *v)
    }

    /// The range containing `key` and its override.
    pub fn range_containing(&self, key: &Key) -> (KeyRange, Option<usize>) {
        let (begin, value) = self
            .boundaries
            .range(..=key.clone())
            .next_back()
            .map(|(k, v)| (k.clone(), *v))
            .unwrap_or((Key::new(), None));
        let end = self
            .boundaries
            .range((
                std::ops::Bound::Excluded(key.clone()),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(crate::types::max_key);
        (KeyRange { begin, end }, value)
    }

    /// All boundary keys, in order. Bootstrap replay splits shards at these.
    pub fn boundaries(&self) -> impl Iterator<Item = &Key> {
        self.boundaries.keys()
    }
}

/// Local tunables of one distributor process.
///
/// Defaults come from [`crate::constants`]; tests override individual fields.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// See [`crate::constants::DD_MOVE_KEYS_PARALLELISM`].
    pub move_keys_parallelism: usize,
    /// See [`crate::constants::DD_MAX_SHARDS_ON_LARGE_TEAMS`].
    pub max_shards_on_large_teams: usize,
    /// See [`crate::constants::DD_STORAGE_WIGGLE_MIN_SS_AGE`].
    pub storage_wiggle_min_ss_age: Duration,
    /// Whether shard location metadata is encoded in physical shards; when
    /// false, valid data moves found at bootstrap are cancelled rather than
    /// preserved.
    pub shard_encode_location_metadata: bool,
    /// Whether the physical-shard status monitor runs.
    pub enable_physical_shard_monitor: bool,
    /// See [`crate::constants::AUDIT_RETRY_COUNT_MAX`].
    pub audit_retry_count_max: u32,
    /// See [`crate::constants::AUDIT_RETRY_DELAY`].
    pub audit_retry_delay: Duration,
    /// See [`crate::constants::MAX_STORAGE_SNAPSHOT_FAULT_TOLERANCE`].
    pub max_storage_snapshot_fault_tolerance: usize,
    /// See [`crate::constants::MAX_COORDINATOR_SNAPSHOT_FAULT_TOLERANCE`].
    pub max_coordinator_snapshot_fault_tolerance: usize,
    /// See [`crate::constants::SNAP_NETWORK_FAILURE_RETRY_LIMIT`].
    pub snap_network_failure_retry_limit: u32,
    /// See [`crate::constants::SNAP_CREATE_MAX_TIMEOUT`].
    pub snap_create_max_timeout: Duration,
    /// See [`crate::constants::SNAP_MINIMUM_TIME_GAP`].
    pub snap_minimum_time_gap: Duration,
    /// Depth of the bounded relocation consumer.
    pub relocation_consumer_depth: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            move_keys_parallelism: DD_MOVE_KEYS_PARALLELISM,
            max_shards_on_large_teams: DD_MAX_SHARDS_ON_LARGE_TEAMS,
            storage_wiggle_min_ss_age: DD_STORAGE_WIGGLE_MIN_SS_AGE,
            shard_encode_location_metadata: true,
            enable_physical_shard_monitor: true,
            audit_retry_count_max: AUDIT_RETRY_COUNT_MAX,
            audit_retry_delay: AUDIT_RETRY_DELAY,
            max_storage_snapshot_fault_tolerance: MAX_STORAGE_SNAPSHOT_FAULT_TOLERANCE,
            max_coordinator_snapshot_fault_tolerance: MAX_COORDINATOR_SNAPSHOT_FAULT_TOLERANCE,
            snap_network_failure_retry_limit: SNAP_NETWORK_FAILURE_RETRY_LIMIT,
            snap_create_max_timeout: SNAP_CREATE_MAX_TIMEOUT,
            snap_minimum_time_gap: SNAP_MINIMUM_TIME_GAP,
            relocation_consumer_depth: RELOCATION_CONSUMER_DEPTH,
        }
    }
}

impl DistributorConfig {
    /// Large-team handling is active when the over-replication allowance is
    /// nonzero; it gates both unhealthy-shard and split-fragment relocations
    /// during bootstrap replay.
    pub fn large_team_enabled(&self) -> bool {
        self.max_shards_on_large_teams > 0
    }
}
