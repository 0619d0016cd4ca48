//! Tests for the audit supervisor: launch, retry, dedup, resume, zombies.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use shardwise::distribution::{
    AuditPhase, AuditState, AuditType, DataDistributor, DistributionError, DistributionMode,
    DistributorConfig, InitialDataDistribution, MockSnapshotTransport, MockStorageAuditClient,
    MockTxnProcessor, PhysicalShardCollection, ShardTeamMap, StatefulWorkers,
    relocation_pipeline,
};
use shardwise::types::{Key, KeyRange, RangeLocations, StorageServerInfo};
use tokio::sync::RwLock;
use uuid::Uuid;

fn key(s: &str) -> Key {
    Bytes::copy_from_slice(s.as_bytes())
}

fn range(a: &str, b: &str) -> KeyRange {
    KeyRange::new(key(a), key(b))
}

fn server(port: u16) -> StorageServerInfo {
    StorageServerInfo {
        id: Uuid::new_v4(),
        dc_id: Some("dc1".to_string()),
        is_tss: false,
        address: SocketAddr::from(([10, 0, 0, 1], port)),
        secondary_address: None,
    }
}

struct Fixture {
    dd: Arc<DataDistributor>,
    txn: Arc<MockTxnProcessor>,
    client: Arc<MockStorageAuditClient>,
}

async fn fixture(knobs: DistributorConfig) -> Fixture {
    let txn = Arc::new(MockTxnProcessor::new());
    let client = Arc::new(MockStorageAuditClient::new(txn.clone()));
    let dd = DataDistributor::builder()
        .knobs(knobs)
        .txn_processor(txn.clone())
        .audit_client(client.clone())
        .snapshot_transport(Arc::new(MockSnapshotTransport::new(
            Vec::new(),
            StatefulWorkers::default(),
        )))
        .build();

    // One replica-location row covering [a, z): two primary replicas and one
    // remote, enough for every audit type.
    let primary = vec![server(4500), server(4501)];
    let mut remote = BTreeMap::new();
    remote.insert("dc2".to_string(), vec![server(4600)]);
    txn.set_range_locations(vec![RangeLocations {
        range: range("a", "z"),
        primary_servers: primary.clone(),
        remote_servers: remote,
    }])
    .await;
    txn.set_servers(primary).await;

    Fixture { dd, txn, client }
}

/// Wire an otherwise empty round so audit resume has a snapshot to read.
fn install_empty_round(fx: &Fixture, init_data: InitialDataDistribution) {
    let shard_map = Arc::new(RwLock::new(ShardTeamMap::new()));
    let physical = Arc::new(RwLock::new(PhysicalShardCollection::new()));
    let (producer, _consumer, bridge) = relocation_pipeline(64);
    tokio::spawn(bridge);
    fx.dd.install_test_round(
        Arc::new(init_data),
        shardwise::distribution::DatabaseConfiguration::single_region(1),
        shard_map,
        physical,
        producer,
    );
}

fn fast_retry_knobs(max_retries: u32) -> DistributorConfig {
    DistributorConfig {
        audit_retry_count_max: max_retries,
        audit_retry_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_audit_completes_clean() {
    let fx = fixture(fast_retry_knobs(5)).await;
    fx.dd.fire_init_signals_for_test();
    let id = fx
        .dd
        .launch_audit(range("a", "z"), AuditType::ValidateHa)
        .await
        .unwrap();
    fx.dd.wait_for_audit_storage(AuditType::ValidateHa, id).await;

    let persisted = fx.txn.persisted_audit(id).await.unwrap();
    assert_eq!(persisted.phase, AuditPhase::Complete);
    assert!(!fx.dd.audit_exists(AuditType::ValidateHa, id));
    assert_eq!(fx.client.calls(), 1);
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_audit_retries_child_failures_then_completes() {
    // Three transient child failures with a retry budget of five: the fourth
    // run's children finish clean and the audit ends Complete.
    let fx = fixture(fast_retry_knobs(5)).await;
    fx.dd.fire_init_signals_for_test();
    fx.client.fail_next(3, DistributionError::BrokenPromise);

    let id = fx
        .dd
        .launch_audit(range("a", "z"), AuditType::ValidateHa)
        .await
        .unwrap();
    fx.dd.wait_for_audit_storage(AuditType::ValidateHa, id).await;

    let persisted = fx.txn.persisted_audit(id).await.unwrap();
    assert_eq!(persisted.phase, AuditPhase::Complete);
    assert_eq!(fx.client.calls(), 4, "three failures plus the clean run");
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_audit_finding_is_final_not_retried() {
    // An audit_storage_error reply is a finding: the audit ends in Error
    // without any retry.
    let fx = fixture(fast_retry_knobs(5)).await;
    fx.dd.fire_init_signals_for_test();
    fx.client.fail_next(1, DistributionError::AuditStorageError);

    let id = fx
        .dd
        .launch_audit(range("a", "z"), AuditType::ValidateHa)
        .await
        .unwrap();
    fx.dd.wait_for_audit_storage(AuditType::ValidateHa, id).await;

    let persisted = fx.txn.persisted_audit(id).await.unwrap();
    assert_eq!(persisted.phase, AuditPhase::Error);
    assert_eq!(fx.client.calls(), 1);
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_audit_exhausted_retries_persist_failed() {
    let fx = fixture(fast_retry_knobs(2)).await;
    fx.dd.fire_init_signals_for_test();
    fx.client.fail_next(100, DistributionError::BrokenPromise);

    let id = fx
        .dd
        .launch_audit(range("a", "z"), AuditType::ValidateHa)
        .await
        .unwrap();
    fx.dd.wait_for_audit_storage(AuditType::ValidateHa, id).await;

    let persisted = fx.txn.persisted_audit(id).await.unwrap();
    assert_eq!(persisted.phase, AuditPhase::Failed);
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_at_most_one_audit_per_type() {
    // Keep the first audit alive by failing its children and parking the
    // retry on a long delay.
    let knobs = DistributorConfig {
        audit_retry_count_max: 100,
        audit_retry_delay: Duration::from_secs(60),
        ..Default::default()
    };
    let fx = fixture(knobs).await;
    fx.dd.fire_init_signals_for_test();
    fx.client.fail_next(1000, DistributionError::BrokenPromise);

    let first = fx
        .dd
        .launch_audit(range("a", "m"), AuditType::ValidateHa)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(fx.dd.audit_exists(AuditType::ValidateHa, first));

    // A covering request joins the running audit.
    let joined = fx
        .dd
        .launch_audit(range("c", "f"), AuditType::ValidateHa)
        .await
        .unwrap();
    assert_eq!(joined, first);

    // A non-covering request of the same type is rejected.
    let rejected = fx.dd.launch_audit(range("a", "z"), AuditType::ValidateHa).await;
    assert_eq!(
        rejected,
        Err(DistributionError::AuditExceededRequestLimit)
    );

    // A different type is unaffected.
    let other = fx
        .dd
        .launch_audit(range("a", "z"), AuditType::ValidateReplica)
        .await;
    assert!(other.is_ok());

    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_audit_progress_skips_completed_rows() {
    // [a, m) is already Complete on disk for the resumed audit; only [m, z)
    // is scheduled again.
    let fx = fixture(fast_retry_knobs(5)).await;
    let resumed = AuditState {
        id: Uuid::new_v4(),
        audit_type: AuditType::ValidateHa,
        range: range("a", "z"),
        phase: AuditPhase::Running,
    };
    fx.txn
        .record_audit_progress(
            AuditType::ValidateHa,
            resumed.id,
            range("a", "m"),
            AuditPhase::Complete,
        )
        .await;
    let mut init_data = InitialDataDistribution::empty(DistributionMode::Enabled);
    init_data.audit_states = vec![resumed.clone()];
    install_empty_round(&fx, init_data);

    fx.dd.resume_storage_audits_for_test();
    fx.dd
        .wait_for_audit_storage(AuditType::ValidateHa, resumed.id)
        .await;

    let persisted = fx.txn.persisted_audit(resumed.id).await.unwrap();
    assert_eq!(persisted.phase, AuditPhase::Complete);
    assert_eq!(fx.client.calls(), 1, "only the uncovered half is audited");
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_resume_storage_audits_restarts_running() {
    // A persisted Running audit from a previous incarnation restarts; a
    // terminal one does not.
    let fx = fixture(fast_retry_knobs(5)).await;
    let running = AuditState {
        id: Uuid::new_v4(),
        audit_type: AuditType::ValidateHa,
        range: range("a", "z"),
        phase: AuditPhase::Running,
    };
    let finished = AuditState {
        id: Uuid::new_v4(),
        audit_type: AuditType::ValidateReplica,
        range: range("a", "z"),
        phase: AuditPhase::Complete,
    };
    let mut init_data = InitialDataDistribution::empty(DistributionMode::Enabled);
    init_data.audit_states = vec![running.clone(), finished.clone()];
    install_empty_round(&fx, init_data);

    fx.dd.resume_storage_audits_for_test();
    assert!(fx.dd.audit_exists(AuditType::ValidateHa, running.id));
    assert!(!fx.dd.audit_exists(AuditType::ValidateReplica, finished.id));

    fx.dd
        .wait_for_audit_storage(AuditType::ValidateHa, running.id)
        .await;
    let persisted = fx.txn.persisted_audit(running.id).await.unwrap();
    assert_eq!(persisted.phase, AuditPhase::Complete);
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_zombie_audit_left_running_on_disk() {
    // Terminal persistence fails with no retry budget: the supervisor is
    // removed while the on-disk phase stays Running.
    let fx = fixture(fast_retry_knobs(0)).await;
    fx.dd.fire_init_signals_for_test();
    let id = {
        // Launch persists Running first, then the two failures hit the
        // Complete write and the Failed write.
        let id = fx
            .dd
            .launch_audit(range("a", "z"), AuditType::ValidateHa)
            .await
            .unwrap();
        fx.txn.fail_next_persists(2).await;
        id
    };
    fx.dd.wait_for_audit_storage(AuditType::ValidateHa, id).await;

    assert!(!fx.dd.audit_exists(AuditType::ValidateHa, id));
    let persisted = fx.txn.persisted_audit(id).await.unwrap();
    assert_eq!(persisted.phase, AuditPhase::Running, "zombie audit");
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_per_server_audit_skips_tss() {
    let fx = fixture(fast_retry_knobs(5)).await;
    fx.dd.fire_init_signals_for_test();
    let normal = server(4700);
    let mut tss = server(4701);
    tss.is_tss = true;
    fx.txn.set_servers(vec![normal.clone(), tss]).await;

    let id = fx
        .dd
        .launch_audit(KeyRange::all(), AuditType::ValidateStorageServerShard)
        .await
        .unwrap();
    fx.dd
        .wait_for_audit_storage(AuditType::ValidateStorageServerShard, id)
        .await;

    let persisted = fx.txn.persisted_audit(id).await.unwrap();
    assert_eq!(persisted.phase, AuditPhase::Complete);
    assert_eq!(fx.client.calls(), 1, "the testing storage server is skipped");
    fx.dd.shutdown_for_test();
}

#[tokio::test]
async fn test_cancel_all_audits_clears_table() {
    let knobs = DistributorConfig {
        audit_retry_count_max: 100,
        audit_retry_delay: Duration::from_secs(60),
        ..Default::default()
    };
    let fx = fixture(knobs).await;
    fx.dd.fire_init_signals_for_test();
    fx.client.fail_next(1000, DistributionError::BrokenPromise);
    let id = fx
        .dd
        .launch_audit(range("a", "z"), AuditType::ValidateHa)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fx.dd.audit_exists(AuditType::ValidateHa, id));

    fx.dd.cancel_all_audits();
    assert!(!fx.dd.audit_exists(AuditType::ValidateHa, id));
    fx.dd.shutdown_for_test();
}
