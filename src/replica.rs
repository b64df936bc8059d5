//! Store-side handling of freeze and checksum requests.
//!
//! A store hosts many replicas over one engine; each replica is a span of
//! that engine described by its range descriptor. The actual pause of writes
//! is up to the embedding replica implementation, which consults
//! [`StoreReplicas::is_frozen`] before applying a command.

use {
    crate::{
        RangeError,
        RangeResult,
        api::{
            ChangeFrozenRequest,
            ChangeFrozenResponse,
            CollectChecksumRequest,
            CollectChecksumResponse,
            PollFrozenRequest,
            PollFrozenResponse,
            RangeSnapshot,
        },
        checksum::range_checksum,
        metadata::{NodeId, RangeDescriptor, RangeId, ReplicaDescriptor, StoreId},
        store::RangeEngine,
    },
    parking_lot::{Mutex, RwLock},
    rapidhash::RapidBuildHasher,
    std::{
        collections::{HashMap, VecDeque},
        sync::Arc,
    },
    uuid::Uuid,
};

#[derive(Debug, Clone)]
struct ReplicaState {
    desc: RangeDescriptor,
    frozen: bool,
}

#[derive(Debug, Clone)]
struct Computed {
    checksum: Vec<u8>,
    snapshot: RangeSnapshot,
}

/// Checksums computed per (range, checksum id).
///
/// Repeated requests for the same id are answered from here, so every
/// requester sees the value computed first. The oldest entry is evicted
/// once the capacity is reached.
#[derive(Debug)]
struct ChecksumCache {
    capacity: usize,
    entries: HashMap<(RangeId, Uuid), Arc<Computed>, RapidBuildHasher>,
    order: VecDeque<(RangeId, Uuid)>,
}

impl ChecksumCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::default(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &(RangeId, Uuid)) -> Option<Arc<Computed>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: (RangeId, Uuid), computed: Arc<Computed>) {
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key);
        self.entries.insert(key, computed);
    }
}

/// Replicas hosted by one store.
pub struct StoreReplicas<E: RangeEngine> {
    node_id: NodeId,
    store_id: StoreId,
    engine: E,
    replicas: RwLock<HashMap<RangeId, ReplicaState, RapidBuildHasher>>,
    checksums: Mutex<ChecksumCache>,
}

impl<E: RangeEngine> StoreReplicas<E> {
    pub fn new(node_id: NodeId, store_id: StoreId, engine: E, checksum_cache_capacity: usize) -> Self {
        Self {
            node_id,
            store_id,
            engine,
            replicas: RwLock::new(HashMap::default()),
            checksums: Mutex::new(ChecksumCache::new(checksum_cache_capacity)),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Starts serving a replica of the range.
    pub fn add_replica(&self, desc: RangeDescriptor) -> RangeResult<()> {
        if self.local_replica(&desc).is_none() {
            return Err(RangeError::ReplicaNotFound {
                range_id: desc.range_id,
                store_id: self.store_id,
            });
        }
        self.replicas.write().insert(
            desc.range_id,
            ReplicaState {
                desc,
                frozen: false,
            },
        );
        Ok(())
    }

    pub fn descriptor(&self, range_id: RangeId) -> Option<RangeDescriptor> {
        self.replicas.read().get(&range_id).map(|s| s.desc.clone())
    }

    pub fn is_frozen(&self, range_id: RangeId) -> bool {
        self.replicas.read().get(&range_id).is_some_and(|s| s.frozen)
    }

    /// Ids of the hosted ranges, ascending.
    pub fn range_ids(&self) -> Vec<RangeId> {
        let mut ids: Vec<_> = self.replicas.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn local_replica(&self, desc: &RangeDescriptor) -> Option<ReplicaDescriptor> {
        desc.find_replica(self.node_id, self.store_id).copied()
    }

    fn check_target(&self, node_id: NodeId, store_id: StoreId) -> RangeResult<()> {
        if node_id != self.node_id || store_id != self.store_id {
            return Err(RangeError::UnknownStore(store_id));
        }
        Ok(())
    }

    pub fn handle_poll_frozen(&self, req: &PollFrozenRequest) -> RangeResult<PollFrozenResponse> {
        self.check_target(req.node_id, req.store_id)?;
        let replicas = self.replicas.read();
        let results = replicas
            .values()
            .filter(|s| s.frozen == req.collect_frozen)
            .filter_map(|s| self.local_replica(&s.desc))
            .collect();
        Ok(PollFrozenResponse { results })
    }

    pub fn handle_change_frozen(
        &self,
        req: &ChangeFrozenRequest,
    ) -> RangeResult<ChangeFrozenResponse> {
        self.check_target(req.node_id, req.store_id)?;
        let mut replicas = self.replicas.write();

        if req.frozen {
            let state = replicas
                .get_mut(&req.range_id)
                .ok_or(RangeError::ReplicaNotFound {
                    range_id: req.range_id,
                    store_id: self.store_id,
                })?;
            state.frozen = true;
            tracing::debug!(range_id = req.range_id, store_id = self.store_id, "replica frozen");
            return Ok(ChangeFrozenResponse { frozen: true });
        }

        if req.descriptors.is_empty() {
            if let Some(state) = replicas.get_mut(&req.range_id) {
                state.frozen = false;
            }
        } else {
            // The range may have been split, merged or re-membered while
            // frozen: serve whatever the thaw hands over, unless it overlaps a
            // live range that superseded it in the meantime.
            replicas.remove(&req.range_id);
            for desc in &req.descriptors {
                if self.local_replica(desc).is_none() {
                    continue;
                }
                let superseded = replicas.values().any(|s| {
                    !s.frozen
                        && s.desc.range_id != desc.range_id
                        && s.desc.start_key < desc.end_key
                        && desc.start_key < s.desc.end_key
                });
                if superseded {
                    tracing::debug!(
                        range = %desc,
                        store_id = self.store_id,
                        "ignoring stale descriptor"
                    );
                    continue;
                }
                replicas.insert(
                    desc.range_id,
                    ReplicaState {
                        desc: desc.clone(),
                        frozen: false,
                    },
                );
            }
        }
        tracing::debug!(range_id = req.range_id, store_id = self.store_id, "replica thawed");
        Ok(ChangeFrozenResponse { frozen: false })
    }

    /// Computes (or recalls) the range checksum.
    ///
    /// The snapshot is attached when the requester supplied a checksum that
    /// differs from this replica's.
    pub fn handle_collect_checksum(
        &self,
        req: &CollectChecksumRequest,
    ) -> RangeResult<CollectChecksumResponse> {
        self.check_target(req.node_id, req.store_id)?;
        let checksum_id = Uuid::from_slice(&req.checksum_id)
            .map_err(|e| RangeError::Transport(format!("malformed checksum id: {e}")))?;
        let key = (req.range_id, checksum_id);

        let cached = self.checksums.lock().get(&key);
        let computed = match cached {
            Some(computed) => computed,
            None => {
                let desc = self
                    .descriptor(req.range_id)
                    .ok_or(RangeError::ReplicaNotFound {
                        range_id: req.range_id,
                        store_id: self.store_id,
                    })?;
                let pairs = self.engine.scan(&desc.start_key, &desc.end_key)?;
                let computed = Arc::new(Computed {
                    checksum: range_checksum(&pairs),
                    snapshot: RangeSnapshot {
                        descriptor: Some(desc),
                        pairs,
                    },
                });
                // A concurrent request for the same id may have won the race;
                // keep its result.
                let mut cache = self.checksums.lock();
                match cache.get(&key) {
                    Some(existing) => existing,
                    None => {
                        cache.insert(key, Arc::clone(&computed));
                        computed
                    }
                }
            }
        };

        let diverged = !req.checksum.is_empty() && req.checksum != computed.checksum;
        Ok(CollectChecksumResponse {
            checksum: computed.checksum.clone(),
            snapshot: diverged.then(|| computed.snapshot.clone()),
        })
    }
}
