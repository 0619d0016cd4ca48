//! Coarse grouping of key ranges into physical shards.
//!
//! When location metadata is encoded, several logical shards can share one
//! physical shard on disk. The collection is rebuilt from the bootstrap
//! snapshot and kept up to date by the queue; the core only initializes it,
//! cleans up emptied groups, and periodically logs its shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;

use super::error::DistributionResult;
use crate::types::{KeyRange, Team};

/// One physical shard: an on-disk grouping of ranges owned by a team set.
#[derive(Debug, Clone)]
pub struct PhysicalShard {
    pub id: u64,
    pub ranges: Vec<KeyRange>,
    pub teams: Vec<Team>,
}

/// All physical shards known to this incarnation.
#[derive(Debug, Default)]
pub struct PhysicalShardCollection {
    shards: HashMap<u64, PhysicalShard>,
}

impl PhysicalShardCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a range under a physical shard id during bootstrap replay.
    pub fn init_physical_shard(&mut self, range: KeyRange, teams: Vec<Team>, id: u64) {
        let entry = self.shards.entry(id).or_insert_with(|| PhysicalShard {
            id,
            ranges: Vec::new(),
            teams: teams.clone(),
        });
        entry.ranges.push(range);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.shards.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Remove a range from its physical shard when a move completes.
    pub fn remove_range(&mut self, id: u64, range: &KeyRange) {
        if let Some(shard) = self.shards.get_mut(&id) {
            shard.ranges.retain(|r| r != range);
        }
    }

    /// Drop physical shards that no longer own any range.
    pub fn clean_up(&mut self) {
        self.shards.retain(|_, shard| !shard.ranges.is_empty());
    }

    fn log_collection(&self) {
        let total_ranges: usize = self.shards.values().map(|s| s.ranges.len()).sum();
        debug!(
            physical_shards = self.shards.len(),
            ranges = total_ranges,
            "physical shard collection status"
        );
    }
}

/// Periodically clean up empty physical shards and log the collection shape.
pub async fn monitor_physical_shard_status(
    collection: Arc<RwLock<PhysicalShardCollection>>,
    interval: Duration,
) -> DistributionResult<()> {
    loop {
        {
            let mut guard = collection.write().await;
            guard.clean_up();
            guard.log_collection();
        }
        tokio::time::sleep(interval).await;
    }
}
