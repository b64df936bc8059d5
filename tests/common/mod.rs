#![allow(dead_code)]

use {
    async_trait::async_trait,
    parking_lot::RwLock,
    rangemeta::{
        ConsistencyChecker,
        CoordinatorConfig,
        MemStore,
        RangeDescriptor,
        RangeError,
        RangeManager,
        RangeResult,
        ReplicaTransport,
        Store,
        StoreDirectory,
        StoreId,
        StoreReplicas,
        Txn,
        api::{
            ChangeFrozenRequest,
            ChangeFrozenResponse,
            CollectChecksumRequest,
            CollectChecksumResponse,
            PollFrozenRequest,
            PollFrozenResponse,
        },
        metadata::{Attributes, NodeDescriptor, StoreDescriptor, UnresolvedAddr},
    },
    std::{
        collections::HashMap,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    },
};

/// Injected misbehaviour of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every call fails.
    Fail,
    /// Every call hangs forever.
    Hang,
    /// Refuses to freeze.
    FailFreeze,
    /// Refuses to thaw.
    FailThaw,
}

/// Delivers requests straight to in-process store handlers.
#[derive(Default)]
pub struct LocalTransport {
    stores: RwLock<HashMap<StoreId, Arc<StoreReplicas<MemStore>>>>,
    faults: RwLock<HashMap<StoreId, Fault>>,
    /// Checksum responses that carried a snapshot.
    snapshots: AtomicUsize,
}

impl LocalTransport {
    pub fn add_store(&self, replicas: Arc<StoreReplicas<MemStore>>) {
        self.stores.write().insert(replicas.store_id(), replicas);
    }

    pub fn set_fault(&self, store_id: StoreId, fault: Fault) {
        self.faults.write().insert(store_id, fault);
    }

    pub fn clear_fault(&self, store_id: StoreId) {
        self.faults.write().remove(&store_id);
    }

    pub fn snapshots_shipped(&self) -> usize {
        self.snapshots.load(Ordering::Relaxed)
    }

    async fn store(
        &self,
        target: &StoreDescriptor,
        frozen: Option<bool>,
    ) -> RangeResult<Arc<StoreReplicas<MemStore>>> {
        let fault = self.faults.read().get(&target.store_id).copied();
        match (fault, frozen) {
            (Some(Fault::Hang), _) => std::future::pending().await,
            (Some(Fault::Fail), _)
            | (Some(Fault::FailFreeze), Some(true))
            | (Some(Fault::FailThaw), Some(false)) => {
                return Err(RangeError::Transport(format!(
                    "store {} unavailable",
                    target.store_id
                )));
            }
            _ => {}
        }
        self.stores
            .read()
            .get(&target.store_id)
            .cloned()
            .ok_or(RangeError::UnknownStore(target.store_id))
    }
}

#[async_trait]
impl ReplicaTransport for LocalTransport {
    async fn poll_frozen(
        &self,
        target: &StoreDescriptor,
        req: PollFrozenRequest,
    ) -> RangeResult<PollFrozenResponse> {
        self.store(target, None).await?.handle_poll_frozen(&req)
    }

    async fn change_frozen(
        &self,
        target: &StoreDescriptor,
        req: ChangeFrozenRequest,
    ) -> RangeResult<ChangeFrozenResponse> {
        self.store(target, Some(req.frozen))
            .await?
            .handle_change_frozen(&req)
    }

    async fn collect_checksum(
        &self,
        target: &StoreDescriptor,
        req: CollectChecksumRequest,
    ) -> RangeResult<CollectChecksumResponse> {
        let resp = self
            .store(target, None)
            .await?
            .handle_collect_checksum(&req)?;
        if resp.snapshot.is_some() {
            self.snapshots.fetch_add(1, Ordering::Relaxed);
        }
        Ok(resp)
    }
}

/// Short windows so failure paths finish quickly.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        rpc_timeout_ms: 100,
        poll_initial_backoff_ms: 1,
        poll_max_backoff_ms: 10,
        max_polls: 5,
        retry_initial_backoff_ms: 1,
        retry_max_backoff_ms: 10,
        ..Default::default()
    }
}

pub fn store_descriptor(store_id: StoreId) -> StoreDescriptor {
    StoreDescriptor {
        store_id,
        attrs: Some(Attributes::new(["ssd"])),
        node: Some(NodeDescriptor {
            node_id: store_id,
            address: Some(UnresolvedAddr::tcp(format!("127.0.0.1:{}", 26000 + store_id))),
            attrs: None,
        }),
        capacity: None,
    }
}

/// Stores `1..=n`, each on the node of the same id, over their own engine.
pub struct Cluster<S: Store = MemStore> {
    pub transport: Arc<LocalTransport>,
    pub directory: Arc<StoreDirectory>,
    pub manager: RangeManager<S>,
    pub checker: ConsistencyChecker,
    pub stores: Vec<Arc<StoreReplicas<MemStore>>>,
}

impl Cluster<MemStore> {
    pub fn new(n: StoreId) -> Self {
        Self::with_store(n, MemStore::new(), test_config())
    }

    pub fn with_config(n: StoreId, config: CoordinatorConfig) -> Self {
        Self::with_store(n, MemStore::new(), config)
    }
}

impl<S: Store> Cluster<S> {
    pub fn with_store(n: StoreId, meta: S, config: CoordinatorConfig) -> Self {
        let transport = Arc::new(LocalTransport::default());
        let directory = Arc::new(
            StoreDirectory::with_stores((1..=n).map(store_descriptor)).unwrap(),
        );
        let stores: Vec<_> = (1..=n)
            .map(|id| Arc::new(StoreReplicas::new(id, id, MemStore::new(), 16)))
            .collect();
        for store in &stores {
            transport.add_store(Arc::clone(store));
        }
        let manager = RangeManager::new(
            meta,
            transport.clone(),
            directory.clone(),
            config.clone(),
        )
        .unwrap();
        let checker = ConsistencyChecker::new(transport.clone(), directory.clone(), config).unwrap();
        Self {
            transport,
            directory,
            manager,
            checker,
            stores,
        }
    }

    /// Bootstraps the first range on every store and starts its replicas.
    pub fn bootstrap(&self) -> RangeDescriptor {
        let ids: Vec<_> = self
            .stores
            .iter()
            .map(|s| (s.node_id(), s.store_id()))
            .collect();
        let desc = self.manager.bootstrap(&ids).unwrap();
        for store in &self.stores {
            store.add_replica(desc.clone()).unwrap();
        }
        desc
    }

    pub fn store(&self, store_id: StoreId) -> &StoreReplicas<MemStore> {
        &self.stores[(store_id - 1) as usize]
    }

    /// Writes the pair to the engine of one store.
    pub fn write(&self, store_id: StoreId, key: &[u8], value: &[u8]) {
        self.store(store_id)
            .engine()
            .transact(|txn| txn.put(key, value.to_vec()))
            .unwrap();
    }

    /// Writes the pair to the engine of every store.
    pub fn write_all(&self, key: &[u8], value: &[u8]) {
        for store in &self.stores {
            self.write(store.store_id(), key, value);
        }
    }

    /// Whether any store reports a frozen replica.
    pub fn any_frozen(&self) -> bool {
        self.stores
            .iter()
            .any(|s| s.range_ids().into_iter().any(|id| s.is_frozen(id)))
    }
}
