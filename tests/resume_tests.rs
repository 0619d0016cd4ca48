//! Tests for bootstrap replay: resume-from-shards and resume-from-data-moves.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use shardwise::constants::{DD_MOVE_KEYS_PARALLELISM, PRIORITY_RECOVER_MOVE, PRIORITY_SPLIT_SHARD};
use shardwise::distribution::{
    relocation_pipeline, DataDistributor, DataMove, DataMoveMeta, DatabaseConfiguration,
    DistributionMode, DistributorConfig, InitialDataDistribution, MockSnapshotTransport,
    MockStorageAuditClient, MockTxnProcessor, PhysicalShardCollection, RelocateReason,
    RelocateShard, ShardInfo, ShardTeamMap, StatefulWorkers,
};
use shardwise::types::{Key, KeyRange, ANONYMOUS_DATA_MOVE};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

fn key(s: &str) -> Key {
    Bytes::copy_from_slice(s.as_bytes())
}

fn range(a: &str, b: &str) -> KeyRange {
    KeyRange::new(key(a), key(b))
}

struct Fixture {
    dd: Arc<DataDistributor>,
    txn: Arc<MockTxnProcessor>,
    shard_map: Arc<RwLock<ShardTeamMap>>,
    consumer: mpsc::Receiver<RelocateShard>,
}

fn fixture(
    init_data: InitialDataDistribution,
    configuration: DatabaseConfiguration,
    knobs: DistributorConfig,
) -> Fixture {
    let txn = Arc::new(MockTxnProcessor::new());
    let dd = DataDistributor::builder()
        .knobs(knobs)
        .txn_processor(txn.clone())
        .audit_client(Arc::new(MockStorageAuditClient::new(txn.clone())))
        .snapshot_transport(Arc::new(MockSnapshotTransport::new(
            Vec::new(),
            StatefulWorkers::default(),
        )))
        .build();
    let shard_map = Arc::new(RwLock::new(ShardTeamMap::new()));
    let physical = Arc::new(RwLock::new(PhysicalShardCollection::new()));
    let (producer, consumer, bridge) = relocation_pipeline(4096);
    tokio::spawn(bridge);
    dd.install_test_round(
        Arc::new(init_data),
        configuration,
        shard_map.clone(),
        physical,
        producer,
    );
    Fixture {
        dd,
        txn,
        shard_map,
        consumer,
    }
}

async fn expect_no_more(consumer: &mut mpsc::Receiver<RelocateShard>) {
    let extra = tokio::time::timeout(Duration::from_millis(100), consumer.recv()).await;
    assert!(extra.is_err(), "unexpected extra relocation: {extra:?}");
}

#[tokio::test]
async fn test_resume_from_shards_replays_inflight_moves_in_order() {
    // Shards at k000..k024; the first DD_MOVE_KEYS_PARALLELISM carry an
    // untracked in-flight destination and must be re-emitted, in key order,
    // at recover-move priority. The rest emit nothing.
    let total = DD_MOVE_KEYS_PARALLELISM + 10;
    let mut shards = Vec::new();
    for i in 0..total {
        let mut shard = ShardInfo::new(key(&format!("k{i:03}")), vec![Uuid::new_v4()]);
        if i < DD_MOVE_KEYS_PARALLELISM {
            shard.has_dest = true;
            shard.primary_dest = vec![Uuid::new_v4()];
            // Untracked move: the distinguished anonymous id.
            shard.dest_id = ANONYMOUS_DATA_MOVE;
        }
        shards.push(shard);
    }
    shards.push(ShardInfo::boundary(shardwise::types::max_key()));

    let mut init_data = InitialDataDistribution::empty(DistributionMode::Enabled);
    init_data.shards = shards.clone();

    let mut fx = fixture(
        init_data,
        DatabaseConfiguration::single_region(1),
        DistributorConfig::default(),
    );
    fx.dd.resume_from_shards().await.unwrap();

    for i in 0..DD_MOVE_KEYS_PARALLELISM {
        let item = fx.consumer.recv().await.expect("missing relocation");
        assert!(!item.is_restore());
        assert!(!item.cancelled);
        assert_eq!(item.data_move_id, ANONYMOUS_DATA_MOVE);
        assert_eq!(item.priority, PRIORITY_RECOVER_MOVE);
        assert_eq!(item.reason, RelocateReason::RecoverMove);
        assert_eq!(item.keys.begin, shards[i].key);
        assert_eq!(item.keys.end, shards[i + 1].key);
    }
    expect_no_more(&mut fx.consumer).await;
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_resume_from_shards_splits_at_custom_boundary() {
    // A user-range boundary at b inside shard [a, c) produces [a, b) and
    // [b, c); both owned by the same team, and only the second fragment is
    // re-registered through the queue.
    let server = Uuid::new_v4();
    let mut init_data = InitialDataDistribution::empty(DistributionMode::Enabled);
    init_data.shards = vec![
        ShardInfo::new(key("a"), vec![server]),
        ShardInfo::boundary(key("c")),
    ];
    init_data
        .user_range_config
        .set_range(range("b", "c"), 1);

    let mut fx = fixture(
        init_data,
        DatabaseConfiguration::single_region(1),
        DistributorConfig::default(),
    );
    fx.dd.resume_from_shards().await.unwrap();

    let item = fx.consumer.recv().await.expect("missing split fragment");
    assert_eq!(item.reason, RelocateReason::SplitShard);
    assert_eq!(item.priority, PRIORITY_SPLIT_SHARD);
    assert_eq!(item.keys, range("b", "c"));
    expect_no_more(&mut fx.consumer).await;

    let map = fx.shard_map.read().await;
    let left = map.teams_for(&key("a")).primary().cloned();
    let right = map.teams_for(&key("b")).primary().cloned();
    assert!(left.is_some());
    assert_eq!(left, right, "both fragments stay on the same team");
    drop(map);
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_resume_from_shards_flags_unhealthy_replica_counts() {
    // Team size 2 but only one source replica: the shard is unhealthy and
    // re-enters the queue at team-unhealthy priority.
    let mut init_data = InitialDataDistribution::empty(DistributionMode::Enabled);
    init_data.shards = vec![
        ShardInfo::new(key("a"), vec![Uuid::new_v4()]),
        ShardInfo::boundary(shardwise::types::max_key()),
    ];

    let mut fx = fixture(
        init_data,
        DatabaseConfiguration::single_region(2),
        DistributorConfig::default(),
    );
    fx.dd.resume_from_shards().await.unwrap();

    let item = fx.consumer.recv().await.expect("missing relocation");
    assert_eq!(item.reason, RelocateReason::TeamUnhealthy);
    expect_no_more(&mut fx.consumer).await;
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_resume_from_data_moves_restores_valid_move() {
    let source = Uuid::new_v4();
    let dest = Uuid::new_v4();
    let move_id = Uuid::new_v4();

    let mut shard = ShardInfo::new(key("m"), vec![source]);
    shard.has_dest = true;
    shard.dest_id = move_id;
    shard.primary_dest = vec![dest];

    let mut init_data = InitialDataDistribution::empty(DistributionMode::Enabled);
    init_data.shards = vec![shard, ShardInfo::boundary(key("n"))];
    init_data.data_moves = vec![DataMove {
        meta: DataMoveMeta {
            id: move_id,
            ranges: vec![range("m", "n")],
        },
        primary_dest: vec![dest],
        remote_dest: Vec::new(),
        valid: true,
        cancelled: false,
    }];
    init_data.to_clean_tombstones = vec![Uuid::new_v4(), Uuid::new_v4()];
    let tombstones = init_data.to_clean_tombstones.clone();

    let mut fx = fixture(
        init_data,
        DatabaseConfiguration::single_region(1),
        DistributorConfig::default(),
    );
    let mut restarts = fx
        .shard_map
        .read()
        .await
        .take_restart_notifications()
        .unwrap();
    fx.dd.resume_relocations().await.unwrap();

    // The shard pass emits nothing (healthy, move is tracked); the move pass
    // emits the restore.
    let item = fx.consumer.recv().await.expect("missing restore");
    assert!(item.is_restore());
    assert!(!item.cancelled);
    assert_eq!(item.data_move_id, move_id);
    assert_eq!(item.keys, range("m", "n"));
    expect_no_more(&mut fx.consumer).await;

    // The destination team is registered so team failures are captured, and
    // the tracker is told to restart on the range.
    let map = fx.shard_map.read().await;
    let owner = map.teams_for(&key("m")).primary().cloned().unwrap();
    assert_eq!(owner.servers(), &[dest]);
    drop(map);
    assert_eq!(restarts.try_recv().unwrap(), range("m", "n"));

    // Tombstone cleanup runs in the background.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.txn.removed_tombstones().await, tombstones);
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_resume_from_data_moves_cancels_when_metadata_disabled() {
    // A valid move found while location metadata is disabled cannot be
    // preserved; the queue is told to undo it.
    let move_id = Uuid::new_v4();
    let mut shard = ShardInfo::new(key("m"), vec![Uuid::new_v4()]);
    shard.has_dest = true;
    shard.dest_id = move_id;

    let mut init_data = InitialDataDistribution::empty(DistributionMode::Enabled);
    init_data.shards = vec![shard, ShardInfo::boundary(key("n"))];
    init_data.data_moves = vec![DataMove {
        meta: DataMoveMeta {
            id: move_id,
            ranges: vec![range("m", "n")],
        },
        primary_dest: vec![Uuid::new_v4()],
        remote_dest: Vec::new(),
        valid: true,
        cancelled: false,
    }];

    let knobs = DistributorConfig {
        shard_encode_location_metadata: false,
        ..Default::default()
    };
    let mut fx = fixture(init_data, DatabaseConfiguration::single_region(1), knobs);
    fx.dd.resume_relocations().await.unwrap();

    let item = fx.consumer.recv().await.expect("missing cancellation");
    assert!(item.cancelled);
    assert_eq!(item.data_move_id, move_id);
    assert!(!item.is_restore());
    expect_no_more(&mut fx.consumer).await;
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_resume_skips_moves_with_empty_ranges() {
    let mut init_data = InitialDataDistribution::empty(DistributionMode::Enabled);
    init_data.data_moves = vec![DataMove {
        meta: DataMoveMeta {
            id: Uuid::new_v4(),
            ranges: Vec::new(),
        },
        primary_dest: Vec::new(),
        remote_dest: Vec::new(),
        valid: true,
        cancelled: false,
    }];

    let mut fx = fixture(
        init_data,
        DatabaseConfiguration::single_region(1),
        DistributorConfig::default(),
    );
    fx.dd.resume_relocations().await.unwrap();
    expect_no_more(&mut fx.consumer).await;
    fx.dd.shutdown_for_test();
}

#[test]
fn test_data_move_validation_cancels_disagreeing_moves() {
    // A shard inside a valid move's range that points at a different move id
    // cancels the move when the snapshot is validated.
    let move_id = Uuid::new_v4();
    let mut shard = ShardInfo::new(key("m"), vec![Uuid::new_v4()]);
    shard.has_dest = true;
    shard.dest_id = Uuid::new_v4();

    let mut init_data = InitialDataDistribution::empty(DistributionMode::Enabled);
    init_data.shards = vec![shard, ShardInfo::boundary(key("n"))];
    init_data.data_moves = vec![DataMove {
        meta: DataMoveMeta {
            id: move_id,
            ranges: vec![range("m", "n")],
        },
        primary_dest: vec![Uuid::new_v4()],
        remote_dest: Vec::new(),
        valid: true,
        cancelled: false,
    }];

    init_data.validate_data_moves();
    assert!(init_data.data_moves[0].cancelled);
}

#[tokio::test]
async fn test_multi_region_registers_remote_teams() {
    let primary = vec![Uuid::new_v4(), Uuid::new_v4()];
    let remote = vec![Uuid::new_v4(), Uuid::new_v4()];
    let mut shard = ShardInfo::new(key("a"), primary.clone());
    shard.remote_src = remote.clone();

    let mut init_data = InitialDataDistribution::empty(DistributionMode::Enabled);
    init_data.shards = vec![shard, ShardInfo::boundary(shardwise::types::max_key())];

    let mut fx = fixture(
        init_data,
        DatabaseConfiguration::multi_region(2, "dc1".into(), "dc2".into()),
        DistributorConfig::default(),
    );
    fx.dd.resume_from_shards().await.unwrap();
    expect_no_more(&mut fx.consumer).await;

    let map = fx.shard_map.read().await;
    let owners = map.teams_for(&key("b"));
    let mut primary_sorted = primary.clone();
    primary_sorted.sort_unstable();
    let mut remote_sorted = remote.clone();
    remote_sorted.sort_unstable();
    assert_eq!(owners.primary().unwrap().servers(), primary_sorted.as_slice());
    assert_eq!(owners.remote().unwrap().servers(), remote_sorted.as_slice());
    drop(map);
    fx.dd.shutdown_for_test();
}
