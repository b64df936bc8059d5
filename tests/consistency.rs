mod common;

use {
    common::{Cluster, Fault, test_config},
    rangemeta::{
        CheckOptions,
        CompletionPolicy,
        CoordinatorConfig,
        RangeError,
        checksum::range_checksum,
    },
    uuid::Uuid,
};

fn seeded(n: i32) -> (Cluster, rangemeta::RangeDescriptor) {
    let cluster = Cluster::new(n);
    let desc = cluster.bootstrap();
    cluster.write_all(b"apple", b"1");
    cluster.write_all(b"banana", b"2");
    cluster.write_all(b"cherry", b"3");
    (cluster, desc)
}

#[tokio::test]
async fn identical_replicas_agree() {
    let (cluster, desc) = seeded(3);
    let report = cluster
        .checker
        .check(&desc, CheckOptions::default())
        .await
        .unwrap();

    assert!(report.is_consistent());
    assert!(report.advisory);
    assert_eq!(report.outcomes.len(), 3);
    assert!(report.outcomes.iter().all(|(_, r)| r.as_ref() == Ok(&report.majority)));
    assert_eq!(report.unreachable().count(), 0);
    report.into_result().unwrap();
}

#[tokio::test]
async fn divergent_replica_is_reported_with_snapshot() {
    let (cluster, desc) = seeded(3);
    cluster.write(3, b"banana", b"rotten");

    let report = cluster
        .checker
        .check(&desc, CheckOptions::default())
        .await
        .unwrap();
    assert_eq!(report.divergent.len(), 1);
    let divergence = &report.divergent[0];
    assert_eq!(divergence.replica.store_id, 3);
    assert_eq!(divergence.expected, report.majority);
    assert_ne!(divergence.actual, divergence.expected);

    let snapshot = divergence.snapshot.as_ref().unwrap();
    assert_eq!(snapshot.descriptor.as_ref(), Some(&desc));
    let banana = snapshot.pairs.iter().find(|kv| kv.key == b"banana").unwrap();
    assert_eq!(banana.value, b"rotten");
    assert_eq!(range_checksum(&snapshot.pairs), divergence.actual);

    match report.into_result() {
        Err(RangeError::DataDivergence { range_id, divergent }) => {
            assert_eq!(range_id, desc.range_id);
            assert_eq!(divergent.len(), 1);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn divergent_first_replica() {
    // The first replica in the set disagrees with the other two.
    let (cluster, desc) = seeded(3);
    cluster.write(1, b"durian", b"4");

    let report = cluster
        .checker
        .check(&desc, CheckOptions::default())
        .await
        .unwrap();
    assert_eq!(report.divergent.len(), 1);
    assert_eq!(report.divergent[0].replica.store_id, 1);
    let snapshot = report.divergent[0].snapshot.as_ref().unwrap();
    assert_eq!(snapshot.pairs.len(), 4);
    assert_eq!(cluster.transport.snapshots_shipped(), 1);
}

#[tokio::test]
async fn only_divergent_replicas_ship_snapshots() {
    let (cluster, desc) = seeded(5);
    cluster.write(1, b"durian", b"4");
    cluster.write(4, b"apple", b"bruised");

    let report = cluster
        .checker
        .check(&desc, CheckOptions::default())
        .await
        .unwrap();
    let divergent: Vec<_> = report.divergent.iter().map(|d| d.replica.store_id).collect();
    assert_eq!(divergent, vec![1, 4]);
    assert!(report.divergent.iter().all(|d| d.snapshot.is_some()));
    assert_eq!(cluster.transport.snapshots_shipped(), 2);

    // A consistent check ships none.
    let healthy = seeded(5);
    healthy
        .0
        .checker
        .check(&healthy.1, CheckOptions::default())
        .await
        .unwrap();
    assert_eq!(healthy.0.transport.snapshots_shipped(), 0);
}

#[tokio::test]
async fn frozen_check_is_authoritative() {
    let (cluster, desc) = seeded(3);
    let report = cluster
        .checker
        .check(&desc, CheckOptions { freeze: true })
        .await
        .unwrap();
    assert!(!report.advisory);
    assert!(report.is_consistent());
    assert!(!cluster.any_frozen());
}

#[tokio::test]
async fn frozen_check_fails_if_freeze_fails() {
    let (cluster, desc) = seeded(3);
    cluster.transport.set_fault(2, Fault::FailFreeze);
    let err = cluster
        .checker
        .check(&desc, CheckOptions { freeze: true })
        .await
        .unwrap_err();
    assert!(matches!(err, RangeError::FreezeFailed { .. }), "{err}");
    assert!(!cluster.any_frozen());
}

#[tokio::test]
async fn hung_replica_with_majority_policy() {
    let config = CoordinatorConfig {
        checksum_policy: CompletionPolicy::Majority,
        ..test_config()
    };
    let cluster = Cluster::with_config(3, config);
    let desc = cluster.bootstrap();
    cluster.write_all(b"k", b"v");
    cluster.transport.set_fault(3, Fault::Hang);

    let report = cluster
        .checker
        .check(&desc, CheckOptions::default())
        .await
        .unwrap();
    assert!(report.is_consistent());
    let collected = report.outcomes.iter().filter(|(_, r)| r.is_ok()).count();
    assert_eq!(collected, 2);
    assert!(
        report.abandoned.iter().any(|r| r.store_id == 3)
            || report.unreachable().any(|(r, _)| r.store_id == 3)
    );
}

#[tokio::test]
async fn hung_replica_with_all_policy() {
    let (cluster, desc) = seeded(3);
    cluster.transport.set_fault(3, Fault::Hang);

    let err = cluster
        .checker
        .check(&desc, CheckOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RangeError::Transport(_)), "{err}");
    assert!(err.to_string().contains("2 of 3"));
}

#[tokio::test]
async fn unreachable_replica_is_skipped() {
    let (cluster, desc) = seeded(3);
    cluster.transport.set_fault(1, Fault::Fail);
    let config = CoordinatorConfig {
        checksum_policy: CompletionPolicy::AtLeast(2),
        ..test_config()
    };
    let checker = rangemeta::ConsistencyChecker::new(
        cluster.transport.clone(),
        cluster.directory.clone(),
        config,
    )
    .unwrap();

    let report = checker.check(&desc, CheckOptions::default()).await.unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.unreachable().map(|(r, _)| r.store_id).collect::<Vec<_>>(), vec![1]);
}

#[tokio::test]
async fn checksum_is_stable_per_id() {
    let (cluster, desc) = seeded(2);
    let replica = desc.replicas[0];
    let id = Uuid::new_v4();

    let first = cluster
        .checker
        .collect_checksum(replica, desc.range_id, id, vec![])
        .await
        .unwrap();
    cluster.write(1, b"late", b"write");
    let again = cluster
        .checker
        .collect_checksum(replica, desc.range_id, id, first.checksum.clone())
        .await
        .unwrap();
    assert_eq!(again.checksum, first.checksum);
    assert!(again.snapshot.is_none());

    let fresh = cluster
        .checker
        .collect_checksum(replica, desc.range_id, Uuid::new_v4(), first.checksum.clone())
        .await
        .unwrap();
    assert_ne!(fresh.checksum, first.checksum);
    assert_eq!(fresh.snapshot.unwrap().pairs.len(), 4);
}

#[tokio::test]
async fn unknown_store_is_rejected() {
    let (cluster, desc) = seeded(1);
    let mut replica = desc.replicas[0];
    replica.store_id = 9;
    let err = cluster
        .checker
        .collect_checksum(replica, desc.range_id, Uuid::new_v4(), vec![])
        .await
        .unwrap_err();
    assert_eq!(err, RangeError::UnknownStore(9));
}
