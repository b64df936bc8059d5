mod common;

use {
    common::{Cluster, Fault, test_config},
    parking_lot::Mutex,
    rangemeta::{
        CompletionPolicy,
        CoordinatorConfig,
        MemStore,
        RangeError,
        RangeResult,
        Store,
        Txn,
        keys::range_descriptor_key,
        store::MemTxn,
    },
};

#[tokio::test]
async fn remove_then_readd_issues_larger_replica_id() {
    let cluster = Cluster::new(3);
    let desc = cluster.bootstrap();
    let original = *desc.find_replica(3, 3).unwrap();

    let shrunk = cluster.manager.remove_replica(b"", 3, 3).await.unwrap();
    assert_eq!(shrunk.range_id, desc.range_id);
    assert!(shrunk.find_replica(3, 3).is_none());
    assert!(cluster.store(3).range_ids().is_empty());
    assert_eq!(cluster.store(1).descriptor(desc.range_id), Some(shrunk.clone()));

    let grown = cluster.manager.add_replica(b"", 3, 3).await.unwrap();
    let readded = *grown.find_replica(3, 3).unwrap();
    assert!(readded.replica_id > original.replica_id);
    assert_eq!(readded.replica_id, shrunk.next_replica_id);
    grown.validate().unwrap();

    // The joining store serves the range straight away.
    assert_eq!(cluster.store(3).descriptor(desc.range_id), Some(grown.clone()));
    assert_eq!(cluster.manager.lookup(b"k").unwrap(), grown);
    assert!(!cluster.any_frozen());
}

#[tokio::test]
async fn membership_errors() {
    let cluster = Cluster::new(2);
    cluster.bootstrap();
    assert!(matches!(
        cluster.manager.add_replica(b"", 1, 1).await,
        Err(RangeError::InvalidDescriptor(_))
    ));
    assert!(matches!(
        cluster.manager.remove_replica(b"", 7, 7).await,
        Err(RangeError::InvalidDescriptor(_))
    ));
    cluster.manager.remove_replica(b"", 2, 2).await.unwrap();
    assert!(matches!(
        cluster.manager.remove_replica(b"", 1, 1).await,
        Err(RangeError::InvalidDescriptor(_))
    ));
    assert!(matches!(
        cluster.manager.add_replica(b"nope", 2, 2).await,
        Err(RangeError::NotFound(_))
    ));
}

#[tokio::test]
async fn merge_needs_colocated_neighbours() {
    let cluster = Cluster::new(3);
    cluster.bootstrap();
    let (left, right) = cluster.manager.split(b"m").await.unwrap();
    cluster
        .manager
        .remove_replica(&right.start_key, 3, 3)
        .await
        .unwrap();

    assert!(matches!(
        cluster.manager.merge(&left.start_key).await,
        Err(RangeError::InvalidDescriptor(_))
    ));

    cluster
        .manager
        .add_replica(&right.start_key, 3, 3)
        .await
        .unwrap();
    let merged = cluster.manager.merge(&left.start_key).await.unwrap();
    assert_eq!(merged.replicas, left.replicas);
    assert!(merged.next_replica_id > left.next_replica_id);
    for store in &cluster.stores {
        assert_eq!(store.range_ids(), vec![merged.range_id]);
    }
}

#[tokio::test]
async fn freeze_failure_aborts() {
    let cluster = Cluster::new(3);
    let desc = cluster.bootstrap();
    cluster.transport.set_fault(3, Fault::FailFreeze);

    let err = cluster.manager.split(b"m").await.unwrap_err();
    assert!(matches!(err, RangeError::FreezeFailed { range_id: 1, .. }), "{err}");

    // Nothing changed and nobody is left frozen.
    assert_eq!(cluster.manager.ranges().unwrap(), vec![desc.clone()]);
    assert!(!cluster.any_frozen());
    for store in &cluster.stores {
        assert_eq!(store.descriptor(desc.range_id), Some(desc.clone()));
    }

    cluster.transport.clear_fault(3);
    cluster.manager.split(b"m").await.unwrap();
    assert_eq!(cluster.manager.ranges().unwrap().len(), 2);
}

#[tokio::test]
async fn hung_replica_fails_freeze() {
    let cluster = Cluster::new(3);
    cluster.bootstrap();
    cluster.transport.set_fault(2, Fault::Hang);

    let err = cluster.manager.split(b"m").await.unwrap_err();
    assert!(matches!(err, RangeError::FreezeFailed { .. }), "{err}");
    assert_eq!(cluster.manager.ranges().unwrap().len(), 1);
    assert!(!cluster.store(1).is_frozen(1));
    assert!(!cluster.store(3).is_frozen(1));
}

#[tokio::test]
async fn failed_thaw_reports_stuck_freeze() {
    let cluster = Cluster::new(3);
    cluster.bootstrap();
    cluster.transport.set_fault(2, Fault::FailThaw);

    match cluster.manager.split(b"m").await {
        Err(RangeError::StuckFreeze { range_id, replicas }) => {
            assert_eq!(range_id, 1);
            assert_eq!(replicas.len(), 1);
            assert_eq!(replicas[0].store_id, 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    // The change is committed regardless; only store 2 is still frozen.
    assert_eq!(cluster.manager.ranges().unwrap().len(), 2);
    cluster.manager.verify().unwrap();
    assert!(cluster.store(2).is_frozen(1));
    assert!(!cluster.store(1).is_frozen(1));
    assert_eq!(cluster.store(1).range_ids().len(), 2);
}

/// Metadata store failing chosen writing commits with a conflict.
struct FlakyStore {
    inner: MemStore,
    commits: Mutex<usize>,
    fail_on: Vec<usize>,
}

impl Store for FlakyStore {
    type Txn = MemTxn;

    fn begin(&self) -> MemTxn {
        self.inner.begin()
    }

    fn commit(&self, txn: MemTxn) -> RangeResult<()> {
        if txn.is_read_only() {
            return self.inner.commit(txn);
        }
        let mut commits = self.commits.lock();
        *commits += 1;
        if self.fail_on.contains(&*commits) {
            return Err(RangeError::Conflict);
        }
        self.inner.commit(txn)
    }
}

fn flaky_cluster(fail_on: Vec<usize>, config: CoordinatorConfig) -> Cluster<FlakyStore> {
    let store = FlakyStore {
        inner: MemStore::new(),
        commits: Mutex::new(0),
        fail_on,
    };
    Cluster::with_store(3, store, config)
}

#[tokio::test]
async fn conflicts_are_retried() {
    // Commit 1 bootstraps, 2 allocates the split ids, 3 is the split itself.
    let cluster = flaky_cluster(vec![3], test_config());
    let parent = cluster.bootstrap();

    let (left, right) = cluster.manager.split(b"m").await.unwrap();
    assert!(left.range_id > parent.range_id + 2, "ids of the failed attempt are skipped");
    assert_eq!(cluster.manager.ranges().unwrap(), vec![left.clone(), right]);
    assert!(!cluster.any_frozen());
    assert_eq!(cluster.store(1).range_ids().len(), 2);
}

#[tokio::test]
async fn conflicts_exhaust_retries() {
    let config = CoordinatorConfig {
        max_mutation_retries: 2,
        ..test_config()
    };
    let cluster = flaky_cluster((2..100).collect(), config);
    let desc = cluster.bootstrap();

    assert_eq!(
        cluster.manager.split(b"m").await,
        Err(RangeError::Conflict)
    );
    assert_eq!(*cluster.manager.store().commits.lock(), 4);
    assert_eq!(cluster.manager.ranges().unwrap(), vec![desc]);
    assert!(!cluster.any_frozen());
}

#[tokio::test]
async fn majority_freeze_tolerates_failed_replica() {
    let config = CoordinatorConfig {
        freeze_policy: CompletionPolicy::Majority,
        ..test_config()
    };
    let cluster = Cluster::with_config(3, config);
    cluster.bootstrap();
    cluster.transport.set_fault(3, Fault::FailFreeze);

    // Freeze proceeds on two of three, and the thaw still reaches all.
    let (left, right) = cluster.manager.split(b"m").await.unwrap();
    for store in &cluster.stores {
        assert_eq!(store.range_ids(), vec![left.range_id, right.range_id]);
    }
    assert!(!cluster.any_frozen());
}

#[tokio::test]
async fn concurrent_splits_of_unrelated_ranges() {
    let config = CoordinatorConfig {
        max_mutation_retries: 20,
        ..test_config()
    };
    let cluster = Cluster::with_config(3, config);
    cluster.bootstrap();
    cluster.manager.split(b"m").await.unwrap();

    // Both commits rewrite shared tree nodes; the loser re-plans and retries.
    let (low, high) = tokio::join!(cluster.manager.split(b"f"), cluster.manager.split(b"t"));
    let (_, f) = low.unwrap();
    let (_, t) = high.unwrap();

    let ranges = cluster.manager.ranges().unwrap();
    let starts: Vec<Vec<u8>> = ranges.iter().map(|d| d.start_key.clone()).collect();
    assert_eq!(starts, [b"".to_vec(), b"f".to_vec(), b"m".to_vec(), b"t".to_vec()]);
    assert_eq!(cluster.manager.lookup(b"g").unwrap(), f);
    assert_eq!(cluster.manager.lookup(b"x").unwrap(), t);
    cluster.manager.verify().unwrap();
    for store in &cluster.stores {
        assert_eq!(store.range_ids().len(), 4);
    }
    assert!(!cluster.any_frozen());
}

#[tokio::test]
async fn merge_keeps_neighbour_read_errors() {
    let cluster = Cluster::new(1);
    cluster.bootstrap();
    let (left, right) = cluster.manager.split(b"m").await.unwrap();

    // An undecodable neighbour is a decode failure, not a missing range.
    cluster
        .manager
        .store()
        .transact(|txn| txn.put(&range_descriptor_key(&right.start_key), vec![0xff]))
        .unwrap();
    assert!(matches!(
        cluster.manager.merge(&left.start_key).await,
        Err(RangeError::Decode(_))
    ));

    cluster
        .manager
        .store()
        .transact(|txn| txn.delete(&range_descriptor_key(&right.start_key)))
        .unwrap();
    assert!(matches!(
        cluster.manager.merge(&left.start_key).await,
        Err(RangeError::CorruptIndex(_))
    ));
}
