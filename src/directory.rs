use {
    crate::{
        RangeError,
        RangeResult,
        metadata::{NodeId, ReplicaDescriptor, StoreDescriptor, StoreId},
    },
    parking_lot::RwLock,
    rapidhash::RapidBuildHasher,
    std::collections::HashMap,
};

/// Directory of the stores replicas can be addressed at.
///
/// Populated from the discovery layer. Every store is registered exactly
/// once; a second registration of the same id is an error rather than a
/// silent overwrite.
#[derive(Debug, Default)]
pub struct StoreDirectory {
    stores: RwLock<HashMap<StoreId, StoreDescriptor, RapidBuildHasher>>,
}

impl StoreDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory holding the given stores.
    pub fn with_stores<I>(stores: I) -> RangeResult<Self>
    where
        I: IntoIterator<Item = StoreDescriptor>,
    {
        let directory = Self::new();
        for store in stores {
            directory.register(store)?;
        }
        Ok(directory)
    }

    /// Registers a store.
    pub fn register(&self, store: StoreDescriptor) -> RangeResult<()> {
        let mut stores = self.stores.write();
        if stores.contains_key(&store.store_id) {
            return Err(RangeError::DuplicateStore(store.store_id));
        }
        stores.insert(store.store_id, store);
        Ok(())
    }

    /// Replaces the published descriptor of an already registered store.
    pub fn update(&self, store: StoreDescriptor) -> RangeResult<()> {
        match self.stores.write().get_mut(&store.store_id) {
            Some(existing) => {
                *existing = store;
                Ok(())
            }
            None => Err(RangeError::UnknownStore(store.store_id)),
        }
    }

    /// Removes and returns (if existed) a store.
    pub fn deregister(&self, store_id: StoreId) -> Option<StoreDescriptor> {
        self.stores.write().remove(&store_id)
    }

    /// Returns the descriptor of the store holding the replica.
    ///
    /// The store must belong to the replica's node.
    pub fn resolve(&self, replica: &ReplicaDescriptor) -> RangeResult<StoreDescriptor> {
        let store = self.get(replica.store_id)?;
        if store.node_id() != replica.node_id {
            return Err(RangeError::UnknownStore(replica.store_id));
        }
        Ok(store)
    }

    /// Returns the descriptor of the store with the given id.
    pub fn get(&self, store_id: StoreId) -> RangeResult<StoreDescriptor> {
        self.stores
            .read()
            .get(&store_id)
            .cloned()
            .ok_or(RangeError::UnknownStore(store_id))
    }

    /// Ids of the stores located on the node.
    pub fn stores_of(&self, node_id: NodeId) -> Vec<StoreId> {
        let mut ids: Vec<_> = self
            .stores
            .read()
            .values()
            .filter(|s| s.node_id() == node_id)
            .map(|s| s.store_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered stores.
    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
