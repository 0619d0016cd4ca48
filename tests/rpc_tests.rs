//! Tests for the admin request surface: halt, metrics, snapshot dedup,
//! exclusion checks, audits, and the blob-restore handshake.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use shardwise::distribution::{
    AuditType, BlobRestoreOutcome, DataDistributor, DistributionError, DistributorConfig,
    DistributorRequest, MetricsReply, MockComponentFactory, MockSnapshotTransport,
    MockStorageAuditClient, MockTenantCache, MockTxnProcessor, PrepareBlobRestoreRequest,
    StatefulWorker, StatefulWorkers, WigglerPhase, WorkerRoles,
};
use shardwise::types::{
    blob_migrator_id, Key, KeyRange, RangeLocations, ServerId, ShardMetric, SnapshotId,
    StorageServerInfo,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

fn key(s: &str) -> Key {
    Bytes::copy_from_slice(s.as_bytes())
}

fn range(a: &str, b: &str) -> KeyRange {
    KeyRange::new(key(a), key(b))
}

fn server(id: ServerId, last_octet: u8, port: u16) -> StorageServerInfo {
    StorageServerInfo {
        id,
        dc_id: Some("dc1".to_string()),
        is_tss: false,
        address: SocketAddr::from(([10, 0, 0, last_octet], port)),
        secondary_address: None,
    }
}

struct Harness {
    dd: Arc<DataDistributor>,
    txn: Arc<MockTxnProcessor>,
    transport: Arc<MockSnapshotTransport>,
    factory: Arc<MockComponentFactory>,
    requests: mpsc::Sender<DistributorRequest>,
    serve: JoinHandle<Result<(), DistributionError>>,
}

async fn harness(knobs: DistributorConfig) -> Harness {
    let txn = Arc::new(MockTxnProcessor::new());
    let storage = Uuid::new_v4();
    let transport = Arc::new(MockSnapshotTransport::new(
        vec![Uuid::new_v4()],
        StatefulWorkers {
            workers: vec![StatefulWorker {
                id: storage,
                roles: WorkerRoles {
                    storage: true,
                    tlog: false,
                    coordinator: true,
                },
            }],
            storage_failures: 0,
        },
    ));
    let dd = DataDistributor::builder()
        .knobs(knobs)
        .txn_processor(txn.clone())
        .audit_client(Arc::new(MockStorageAuditClient::new(txn.clone())))
        .snapshot_transport(transport.clone())
        .build();
    let factory = Arc::new(MockComponentFactory::new());
    let (requests, requests_rx) = mpsc::channel(32);
    let serve = tokio::spawn(dd.clone().serve(factory.clone(), requests_rx));
    // Let the first graph round assemble.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Harness {
        dd,
        txn,
        transport,
        factory,
        requests,
        serve,
    }
}

async fn halt(h: Harness) {
    let (reply, rx) = oneshot::channel();
    h.requests
        .send(DistributorRequest::Halt {
            requester: Uuid::new_v4(),
            reply,
        })
        .await
        .unwrap();
    rx.await.unwrap();
    assert_eq!(h.serve.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn test_halt_stops_the_distributor() {
    let h = harness(DistributorConfig::default()).await;
    halt(h).await;
}

#[tokio::test]
async fn test_metrics_list_and_median() {
    let h = harness(DistributorConfig::default()).await;
    h.factory.set_metrics(vec![
        ShardMetric {
            range: range("a", "b"),
            shard_bytes: 10,
        },
        ShardMetric {
            range: range("b", "c"),
            shard_bytes: 30,
        },
        ShardMetric {
            range: range("c", "d"),
            shard_bytes: 20,
        },
    ]);

    let (reply, rx) = oneshot::channel();
    h.requests
        .send(DistributorRequest::Metrics {
            keys: KeyRange::all(),
            shard_limit: 10,
            mid_only: false,
            reply,
        })
        .await
        .unwrap();
    match rx.await.unwrap().unwrap() {
        MetricsReply::List(list) => assert_eq!(list.len(), 3),
        other => panic!("expected a list, got {other:?}"),
    }

    let (reply, rx) = oneshot::channel();
    h.requests
        .send(DistributorRequest::Metrics {
            keys: KeyRange::all(),
            shard_limit: 10,
            mid_only: true,
            reply,
        })
        .await
        .unwrap();
    assert_eq!(rx.await.unwrap().unwrap(), MetricsReply::MidShardSize(20));
    halt(h).await;
}

#[tokio::test]
async fn test_duplicate_snapshot_request_supersedes_reply() {
    // Two concurrent requests with the same UID: the first caller is told it
    // was superseded, the second observes the actual outcome.
    let h = harness(DistributorConfig::default()).await;
    h.transport.set_snap_delay_ms(300);
    let snap_id = SnapshotId::new_v4();
    let payload = Bytes::from_static(b"args");

    let (reply1, rx1) = oneshot::channel();
    h.requests
        .send(DistributorRequest::Snapshot {
            payload: payload.clone(),
            snap_id,
            reply: reply1,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (reply2, rx2) = oneshot::channel();
    h.requests
        .send(DistributorRequest::Snapshot {
            payload: payload.clone(),
            snap_id,
            reply: reply2,
        })
        .await
        .unwrap();

    assert_eq!(
        rx1.await.unwrap(),
        Err(DistributionError::DuplicateSnapshotRequest)
    );
    assert_eq!(rx2.await.unwrap(), Ok(()));
    halt(h).await;
}

#[tokio::test]
async fn test_finished_snapshot_result_is_replayed() {
    let h = harness(DistributorConfig::default()).await;
    let snap_id = SnapshotId::new_v4();
    let payload = Bytes::from_static(b"args");

    let (reply, rx) = oneshot::channel();
    h.requests
        .send(DistributorRequest::Snapshot {
            payload: payload.clone(),
            snap_id,
            reply,
        })
        .await
        .unwrap();
    let first = rx.await.unwrap();
    assert_eq!(first, Ok(()));

    // A duplicate within the retention window replays the stored result
    // without running the protocol again.
    let calls_before = h.transport.call_log().len();
    let (reply, rx) = oneshot::channel();
    h.requests
        .send(DistributorRequest::Snapshot {
            payload,
            snap_id,
            reply,
        })
        .await
        .unwrap();
    assert_eq!(rx.await.unwrap(), first);
    assert_eq!(h.transport.call_log().len(), calls_before);
    halt(h).await;
}

#[tokio::test]
async fn test_exclusion_safety_check() {
    let h = harness(DistributorConfig::default()).await;
    let s1 = Uuid::new_v4();
    let s2 = Uuid::new_v4();
    h.txn
        .set_servers(vec![server(s1, 1, 4500), server(s2, 2, 4500)])
        .await;

    // With fewer than two teams the check is always unsafe.
    h.factory.primary_collection.set_teams(vec![vec![s1]]);
    let (reply, rx) = oneshot::channel();
    h.requests
        .send(DistributorRequest::ExclusionSafetyCheck {
            exclusions: vec![shardwise::types::AddressExclusion::machine(
                "10.0.0.1".parse().unwrap(),
            )],
            reply,
        })
        .await
        .unwrap();
    assert!(!rx.await.unwrap().safe);

    // With enough teams the collection decides.
    h.factory
        .primary_collection
        .set_teams(vec![vec![s1], vec![s2]]);
    h.factory.primary_collection.set_safe(true);
    let (reply, rx) = oneshot::channel();
    h.requests
        .send(DistributorRequest::ExclusionSafetyCheck {
            exclusions: vec![shardwise::types::AddressExclusion::machine(
                "10.0.0.1".parse().unwrap(),
            )],
            reply,
        })
        .await
        .unwrap();
    assert!(rx.await.unwrap().safe);
    halt(h).await;
}

#[tokio::test]
async fn test_wiggler_state_reports_primary_only_in_single_region() {
    let h = harness(DistributorConfig::default()).await;
    let (reply, rx) = oneshot::channel();
    h.requests
        .send(DistributorRequest::WigglerState { reply })
        .await
        .unwrap();
    let state = rx.await.unwrap();
    assert_eq!(state.primary.unwrap().phase, WigglerPhase::Pause);
    assert!(state.remote.is_none());
    halt(h).await;
}

#[tokio::test]
async fn test_trigger_audit_over_rpc() {
    let h = harness(DistributorConfig {
        audit_retry_delay: Duration::from_millis(10),
        ..Default::default()
    })
    .await;
    let primary = vec![
        server(Uuid::new_v4(), 1, 4500),
        server(Uuid::new_v4(), 1, 4501),
    ];
    let mut remote = BTreeMap::new();
    remote.insert("dc2".to_string(), vec![server(Uuid::new_v4(), 9, 4500)]);
    h.txn
        .set_range_locations(vec![RangeLocations {
            range: range("a", "z"),
            primary_servers: primary,
            remote_servers: remote,
        }])
        .await;

    let (reply, rx) = oneshot::channel();
    h.requests
        .send(DistributorRequest::TriggerAudit {
            audit_type: AuditType::ValidateHa,
            range: range("a", "z"),
            reply,
        })
        .await
        .unwrap();
    let id = rx.await.unwrap().unwrap();
    h.dd.wait_for_audit_storage(AuditType::ValidateHa, id).await;
    halt(h).await;
}

#[tokio::test]
async fn test_tenants_over_quota() {
    let txn = Arc::new(MockTxnProcessor::new());
    let transport = Arc::new(MockSnapshotTransport::new(
        Vec::new(),
        StatefulWorkers::default(),
    ));
    let dd = DataDistributor::builder()
        .txn_processor(txn.clone())
        .audit_client(Arc::new(MockStorageAuditClient::new(txn.clone())))
        .snapshot_transport(transport.clone())
        .build();
    let factory = Arc::new(MockComponentFactory::new());
    factory.set_tenant_cache(Arc::new(MockTenantCache::new(vec![
        "tenant-a".to_string(),
        "tenant-b".to_string(),
    ])));
    let (requests, requests_rx) = mpsc::channel(32);
    let serve = tokio::spawn(dd.clone().serve(factory.clone(), requests_rx));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (reply, rx) = oneshot::channel();
    requests
        .send(DistributorRequest::TenantsOverQuota { reply })
        .await
        .unwrap();
    assert_eq!(rx.await.unwrap(), vec!["tenant-a", "tenant-b"]);

    let (reply, halt_rx) = oneshot::channel();
    requests
        .send(DistributorRequest::Halt {
            requester: Uuid::new_v4(),
            reply,
        })
        .await
        .unwrap();
    halt_rx.await.unwrap();
    assert_eq!(serve.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn test_blob_restore_rejects_non_migrator() {
    let h = harness(DistributorConfig::default()).await;
    let (reply, rx) = oneshot::channel();
    h.requests
        .send(DistributorRequest::PrepareBlobRestore(
            PrepareBlobRestoreRequest {
                ssi: server(Uuid::new_v4(), 7, 4500),
                keys: KeyRange::all(),
                requester: Uuid::new_v4(),
                reply,
            },
        ))
        .await
        .unwrap();
    assert_eq!(rx.await.unwrap(), Err(DistributionError::OperationFailed));
    halt(h).await;
}

#[tokio::test]
async fn test_blob_restore_conflicts_with_snapshot() {
    let h = harness(DistributorConfig::default()).await;
    assert!(h.dd.enabled_state().try_set_snapshot(Uuid::new_v4()));

    let (reply, rx) = oneshot::channel();
    h.requests
        .send(DistributorRequest::PrepareBlobRestore(
            PrepareBlobRestoreRequest {
                ssi: server(blob_migrator_id(1), 7, 4500),
                keys: KeyRange::all(),
                requester: Uuid::new_v4(),
                reply,
            },
        ))
        .await
        .unwrap();
    assert_eq!(rx.await.unwrap(), Ok(BlobRestoreOutcome::ConflictSnapshot));
    halt(h).await;
}

#[tokio::test]
async fn test_blob_restore_success_rebuilds_graph() {
    let h = harness(DistributorConfig::default()).await;
    let requester = Uuid::new_v4();
    let migrator = server(blob_migrator_id(2), 7, 4500);

    let (reply, rx) = oneshot::channel();
    h.requests
        .send(DistributorRequest::PrepareBlobRestore(
            PrepareBlobRestoreRequest {
                ssi: migrator.clone(),
                keys: range("a", "m"),
                requester,
                reply,
            },
        ))
        .await
        .unwrap();
    assert_eq!(rx.await.unwrap(), Ok(BlobRestoreOutcome::Success));

    // The migrator was registered and the restore marker persisted.
    let added = h.txn.added_servers().await;
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].id, migrator.id);
    let restores = h.txn.blob_restores().await;
    assert_eq!(restores, vec![(range("a", "m"), migrator.id, requester)]);

    // Movement resumed and the distributor is still serving.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.dd.enabled_state().is_enabled());
    halt(h).await;
}
