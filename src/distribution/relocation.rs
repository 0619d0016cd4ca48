//! Relocation work items and the producer/consumer bridge.
//!
//! The control core never moves data itself: it emits [`RelocateShard`] work
//! items that an external queue schedules and executes. Items flow through a
//! two-stage pipeline:
//!
//! 1. every producer (bootstrap replay, shard tracker, team collections)
//!    pushes into an unbounded producer side, so emission never blocks a
//!    metadata walk;
//! 2. a yielding bridge forwards items in FIFO order into a *bounded*
//!    consumer channel, providing backpressure toward the queue and a
//!    cooperative yield between forwards.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::error::{DistributionError, DistributionResult};
use super::initial_snapshot::DataMove;
use crate::constants::{
    PRIORITY_RECOVER_MOVE, PRIORITY_SPLIT_SHARD, PRIORITY_TEAM_HEALTHY, PRIORITY_TEAM_UNHEALTHY,
};
use crate::types::{DataMoveId, KeyRange, ANONYMOUS_DATA_MOVE};

/// Why a relocation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocateReason {
    /// Replay of a move abandoned by a previous incarnation.
    RecoverMove,
    /// The owning team has the wrong replica count.
    TeamUnhealthy,
    /// Re-registration of a fragment split off a larger shard.
    SplitShard,
    /// Split driven by write bandwidth.
    WriteSplit,
    /// Split driven by shard size.
    SizeSplit,
    /// Anything else (rebalance, merge, operator action).
    Other,
}

impl RelocateReason {
    /// The queue priority this reason maps to.
    pub fn priority(&self) -> i32 {
        match self {
            RelocateReason::RecoverMove => PRIORITY_RECOVER_MOVE,
            RelocateReason::TeamUnhealthy => PRIORITY_TEAM_UNHEALTHY,
            RelocateReason::SplitShard | RelocateReason::WriteSplit | RelocateReason::SizeSplit => {
                PRIORITY_SPLIT_SHARD
            }
            RelocateReason::Other => PRIORITY_TEAM_HEALTHY,
        }
    }

    /// True for split reasons that must carry the pre-split parent range.
    pub fn is_data_split(&self) -> bool {
        matches!(self, RelocateReason::WriteSplit | RelocateReason::SizeSplit)
    }
}

impl std::fmt::Display for RelocateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RelocateReason::RecoverMove => "recover_move",
            RelocateReason::TeamUnhealthy => "team_unhealthy",
            RelocateReason::SplitShard => "split_shard",
            RelocateReason::WriteSplit => "write_split",
            RelocateReason::SizeSplit => "size_split",
            RelocateReason::Other => "other",
        };
        f.write_str(s)
    }
}

/// A work item emitted by the core to the relocation queue.
#[derive(Debug, Clone)]
pub struct RelocateShard {
    pub keys: KeyRange,
    pub priority: i32,
    pub reason: RelocateReason,
    /// Identifier of the tracked move this item belongs to;
    /// [`ANONYMOUS_DATA_MOVE`] when no move is tracked.
    pub data_move_id: DataMoveId,
    /// Restore pointer for a preserved in-flight move.
    pub data_move: Option<Arc<DataMove>>,
    /// True when the queue must undo the referenced move instead of
    /// finishing it.
    pub cancelled: bool,
    parent_range: Option<KeyRange>,
}

impl RelocateShard {
    pub fn new(keys: KeyRange, reason: RelocateReason) -> Self {
        Self {
            keys,
            priority: reason.priority(),
            reason,
            data_move_id: ANONYMOUS_DATA_MOVE,
            data_move: None,
            cancelled: false,
            parent_range: None,
        }
    }

    /// Record the pre-split range. Only valid for `write_split`/`size_split`.
    pub fn set_parent_range(&mut self, parent: KeyRange) {
        assert!(
            self.reason.is_data_split(),
            "parent range only applies to write_split/size_split relocations"
        );
        self.parent_range = Some(parent);
    }

    pub fn parent_range(&self) -> Option<&KeyRange> {
        self.parent_range.as_ref()
    }

    /// True when this item restores a preserved data move.
    pub fn is_restore(&self) -> bool {
        self.data_move.is_some()
    }
}

/// Producer handle for relocation items. Cheap to clone; senders never block.
#[derive(Clone)]
pub struct RelocationProducer {
    tx: mpsc::UnboundedSender<RelocateShard>,
}

impl RelocationProducer {
    pub fn send(&self, item: RelocateShard) -> DistributionResult<()> {
        super::metrics::relocation_emitted(&item.reason.to_string());
        self.tx
            .send(item)
            .map_err(|_| DistributionError::BrokenPromise)
    }
}

/// Build the relocation pipeline: an unbounded producer, a bounded consumer,
/// and the bridge future that forwards between them.
///
/// The bridge preserves production order, applies backpressure once the
/// consumer holds `consumer_depth` undelivered items, and yields between
/// forwards so a replay storm cannot monopolize the scheduler. It resolves
/// when every producer handle is dropped.
pub fn relocation_pipeline(
    consumer_depth: usize,
) -> (
    RelocationProducer,
    mpsc::Receiver<RelocateShard>,
    impl std::future::Future<Output = DistributionResult<()>>,
) {
    let (producer_tx, mut producer_rx) = mpsc::unbounded_channel::<RelocateShard>();
    let (consumer_tx, consumer_rx) = mpsc::channel::<RelocateShard>(consumer_depth);

    let bridge = async move {
        while let Some(item) = producer_rx.recv().await {
            if consumer_tx.send(item).await.is_err() {
                // Queue went away; the graph is being torn down.
                return Err(DistributionError::BrokenPromise);
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    };

    (RelocationProducer { tx: producer_tx }, consumer_rx, bridge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn range(a: &str, b: &str) -> KeyRange {
        KeyRange::new(Bytes::copy_from_slice(a.as_bytes()), Bytes::copy_from_slice(b.as_bytes()))
    }

    #[test]
    fn test_reason_priorities() {
        assert_eq!(RelocateReason::RecoverMove.priority(), PRIORITY_RECOVER_MOVE);
        assert_eq!(
            RelocateReason::TeamUnhealthy.priority(),
            PRIORITY_TEAM_UNHEALTHY
        );
        assert_eq!(RelocateReason::SplitShard.priority(), PRIORITY_SPLIT_SHARD);
        assert_eq!(RelocateReason::WriteSplit.priority(), PRIORITY_SPLIT_SHARD);
        assert_eq!(RelocateReason::SizeSplit.priority(), PRIORITY_SPLIT_SHARD);
    }

    #[test]
    fn test_new_item_defaults() {
        let item = RelocateShard::new(range("a", "b"), RelocateReason::RecoverMove);
        assert_eq!(item.data_move_id, ANONYMOUS_DATA_MOVE);
        assert!(!item.cancelled);
        assert!(!item.is_restore());
        assert!(item.parent_range().is_none());
    }

    #[test]
    fn test_parent_range_on_split() {
        let mut item = RelocateShard::new(range("b", "c"), RelocateReason::SizeSplit);
        item.set_parent_range(range("a", "d"));
        assert_eq!(item.parent_range(), Some(&range("a", "d")));
    }

    #[test]
    #[should_panic(expected = "parent range only applies")]
    fn test_parent_range_rejected_for_other_reasons() {
        let mut item = RelocateShard::new(range("b", "c"), RelocateReason::TeamUnhealthy);
        item.set_parent_range(range("a", "d"));
    }

    #[tokio::test]
    async fn test_pipeline_preserves_order() {
        let (producer, mut consumer, bridge) = relocation_pipeline(4);
        let bridge = tokio::spawn(bridge);

        for (a, b) in [("a", "b"), ("b", "c"), ("c", "d")] {
            producer
                .send(RelocateShard::new(range(a, b), RelocateReason::RecoverMove))
                .unwrap();
        }
        drop(producer);

        let mut received = Vec::new();
        while let Some(item) = consumer.recv().await {
            received.push(item.keys);
        }
        assert_eq!(
            received,
            vec![range("a", "b"), range("b", "c"), range("c", "d")]
        );
        bridge.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_bridge_errors_when_consumer_drops() {
        let (producer, consumer, bridge) = relocation_pipeline(1);
        drop(consumer);
        producer
            .send(RelocateShard::new(range("a", "b"), RelocateReason::Other))
            .unwrap();
        assert_eq!(bridge.await, Err(DistributionError::BrokenPromise));
    }
}
