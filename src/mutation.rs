//! Splits, merges and replica membership changes.
//!
//! Every change runs the same protocol: plan the new descriptors from the
//! current ones, freeze the replicas of the affected ranges, commit the
//! descriptors and tree update in one store transaction (re-checking that
//! the planned-from descriptors are still current), then thaw the replicas
//! under the new descriptors. Retryable failures re-run the whole protocol.

use {
    crate::{
        RangeError,
        RangeResult,
        api::ReplicaTransport,
        config::CoordinatorConfig,
        directory::StoreDirectory,
        freeze::FreezeCoordinator,
        keys::RANGE_ID_GENERATOR_KEY,
        metadata::{KEY_MAX, KEY_MIN, NodeId, RangeDescriptor, RangeId, ReplicaDescriptor, StoreId},
        store::{Store, Txn},
        tree::{RangeTreeTxn, TreeShape},
    },
    std::sync::Arc,
    tokio::time,
};

/// Descriptor replacement planned by one mutation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Change {
    /// Descriptors the plan was computed from.
    pub current: Vec<RangeDescriptor>,
    /// Descriptors replacing them, covering the same span.
    pub next: Vec<RangeDescriptor>,
}

impl Change {
    /// Replicas that join with this change and were never frozen.
    fn joining(&self) -> Vec<ReplicaDescriptor> {
        let mut joining: Vec<ReplicaDescriptor> = Vec::new();
        for replica in self.next.iter().flat_map(|d| &d.replicas) {
            let known = self
                .current
                .iter()
                .flat_map(|d| &d.replicas)
                .chain(&joining)
                .any(|r| r.same_location(replica));
            if !known {
                joining.push(*replica);
            }
        }
        joining
    }
}

/// Writes the change if the current descriptors are still the stored ones.
pub(crate) fn commit_change<T: Txn + ?Sized>(txn: &mut T, change: &Change) -> RangeResult<()> {
    let mut tree = RangeTreeTxn::new(txn);
    for desc in &change.current {
        if tree.descriptor(&desc.start_key)?.as_ref() != Some(desc) {
            return Err(RangeError::Conflict);
        }
    }
    for desc in &change.next {
        desc.validate()?;
    }

    for desc in &change.current {
        if !change.next.iter().any(|n| n.start_key == desc.start_key) {
            tree.delete_descriptor(&desc.start_key)?;
            tree.delete(&desc.start_key)?;
        }
    }
    for desc in &change.next {
        if !change.current.iter().any(|c| c.start_key == desc.start_key) {
            tree.insert(&desc.start_key)?;
        }
        tree.put_descriptor(desc)?;
    }
    Ok(())
}

fn read_last_range_id<T: Txn + ?Sized>(txn: &mut T) -> RangeResult<Option<RangeId>> {
    let Some(raw) = txn.get(RANGE_ID_GENERATOR_KEY)? else {
        return Ok(None);
    };
    let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
        RangeError::CorruptIndex(format!("range id generator holds {} bytes", raw.len()))
    })?;
    Ok(Some(RangeId::from_be_bytes(bytes)))
}

fn write_last_range_id<T: Txn + ?Sized>(txn: &mut T, id: RangeId) -> RangeResult<()> {
    txn.put(RANGE_ID_GENERATOR_KEY, id.to_be_bytes().to_vec())
}

/// Range index manager.
///
/// Owns the metadata store and drives the freeze/commit/thaw protocol for
/// every change to the set of ranges.
pub struct RangeManager<S: Store> {
    store: S,
    freezer: FreezeCoordinator,
    config: CoordinatorConfig,
}

impl<S: Store> RangeManager<S> {
    pub fn new(
        store: S,
        transport: Arc<dyn ReplicaTransport>,
        directory: Arc<StoreDirectory>,
        config: CoordinatorConfig,
    ) -> RangeResult<Self> {
        let freezer = FreezeCoordinator::new(transport, directory, config.clone())?;
        Ok(Self {
            store,
            freezer,
            config,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn freezer(&self) -> &FreezeCoordinator {
        &self.freezer
    }

    /// Creates the first range, spanning the whole keyspace, on the given
    /// stores.
    pub fn bootstrap(&self, stores: &[(NodeId, StoreId)]) -> RangeResult<RangeDescriptor> {
        let mut desc = RangeDescriptor::new(1, KEY_MIN, KEY_MAX);
        for (node_id, store_id) in stores {
            desc.add_replica(*node_id, *store_id)?;
        }
        desc.validate()?;

        self.store.transact(|txn| {
            if read_last_range_id(txn)?.is_some() {
                return Err(RangeError::AlreadyBootstrapped);
            }
            let mut tree = RangeTreeTxn::new(&mut *txn);
            if !tree.is_empty()? {
                return Err(RangeError::AlreadyBootstrapped);
            }
            tree.put_descriptor(&desc)?;
            tree.insert(&desc.start_key)?;
            write_last_range_id(txn, desc.range_id)
        })?;
        tracing::debug!(range = %desc, "bootstrapped range index");
        Ok(desc)
    }

    /// Issues `n` fresh range ids, larger than every id issued before.
    pub fn allocate_range_ids(&self, n: usize) -> RangeResult<Vec<RangeId>> {
        self.store.transact(|txn| {
            let last = read_last_range_id(txn)?.unwrap_or_default();
            let ids: Vec<RangeId> = (1..=n as RangeId).map(|i| last + i).collect();
            if let Some(&new_last) = ids.last() {
                write_last_range_id(txn, new_last)?;
            }
            Ok(ids)
        })
    }

    /// Range containing the key.
    pub fn lookup(&self, key: &[u8]) -> RangeResult<RangeDescriptor> {
        self.store.transact(|txn| RangeTreeTxn::new(txn).lookup(key))
    }

    /// All live ranges in key order.
    pub fn ranges(&self) -> RangeResult<Vec<RangeDescriptor>> {
        self.store.transact(|txn| RangeTreeTxn::new(txn).ranges())
    }

    /// Checks the index invariants and that the ranges partition the keyspace.
    pub fn verify(&self) -> RangeResult<TreeShape> {
        let (shape, ranges) = self.store.transact(|txn| {
            let mut tree = RangeTreeTxn::new(txn);
            Ok((tree.verify()?, tree.ranges()?))
        })?;
        let mut expected_start = KEY_MIN;
        for desc in &ranges {
            if desc.start_key != expected_start {
                return Err(RangeError::CorruptIndex(format!(
                    "range {desc} does not start at {}",
                    expected_start.escape_ascii()
                )));
            }
            expected_start = desc.end_key.as_slice();
        }
        if !ranges.is_empty() && expected_start != KEY_MAX {
            return Err(RangeError::CorruptIndex(format!(
                "ranges end at {} instead of the keyspace end",
                expected_start.escape_ascii()
            )));
        }
        Ok(shape)
    }

    fn current(&self, start_key: &[u8]) -> RangeResult<RangeDescriptor> {
        self.store
            .transact(|txn| RangeTreeTxn::new(txn).descriptor(start_key))?
            .ok_or_else(|| RangeError::NotFound(start_key.to_vec()))
    }

    /// Splits the range containing `split_key` into `[start, split_key)` and
    /// `[split_key, end)`, both under fresh range ids.
    pub async fn split(&self, split_key: &[u8]) -> RangeResult<(RangeDescriptor, RangeDescriptor)> {
        let next = self
            .run("split", || {
                let parent = self.lookup(split_key)?;
                let ids = self.allocate_range_ids(2)?;
                let (left, right) = parent.split(split_key, ids[0], ids[1])?;
                Ok(Change {
                    current: vec![parent],
                    next: vec![left, right],
                })
            })
            .await?;
        let mut next = next.into_iter();
        match (next.next(), next.next()) {
            (Some(left), Some(right)) => Ok((left, right)),
            _ => Err(RangeError::CorruptIndex("split produced no pair".into())),
        }
    }

    /// Merges the range starting at `left_start` with its right neighbour.
    pub async fn merge(&self, left_start: &[u8]) -> RangeResult<RangeDescriptor> {
        let next = self
            .run("merge", || {
                let left = self.current(left_start)?;
                if left.end_key == KEY_MAX {
                    return Err(RangeError::InvalidDescriptor(format!(
                        "range {left} has no right neighbour"
                    )));
                }
                let right = self.current(&left.end_key).map_err(|err| match err {
                    RangeError::NotFound(_) => {
                        RangeError::CorruptIndex(format!("range after {left} is missing"))
                    }
                    err => err,
                })?;
                let id = self.allocate_range_ids(1)?[0];
                let merged = RangeDescriptor::merge(&left, &right, id)?;
                Ok(Change {
                    current: vec![left, right],
                    next: vec![merged],
                })
            })
            .await?;
        single(next)
    }

    /// Adds a replica on the given store to the range starting at `start_key`.
    pub async fn add_replica(
        &self,
        start_key: &[u8],
        node_id: NodeId,
        store_id: StoreId,
    ) -> RangeResult<RangeDescriptor> {
        let next = self
            .run("add_replica", || {
                let current = self.current(start_key)?;
                let mut next = current.clone();
                next.add_replica(node_id, store_id)?;
                Ok(Change {
                    current: vec![current],
                    next: vec![next],
                })
            })
            .await?;
        single(next)
    }

    /// Removes the replica on the given store from the range starting at
    /// `start_key`.
    pub async fn remove_replica(
        &self,
        start_key: &[u8],
        node_id: NodeId,
        store_id: StoreId,
    ) -> RangeResult<RangeDescriptor> {
        let next = self
            .run("remove_replica", || {
                let current = self.current(start_key)?;
                let mut next = current.clone();
                if next.remove_replica(node_id, store_id).is_none() {
                    return Err(RangeError::InvalidDescriptor(format!(
                        "range {current} has no replica on node {node_id} store {store_id}"
                    )));
                }
                if next.replicas.is_empty() {
                    return Err(RangeError::InvalidDescriptor(format!(
                        "removing the last replica of range {current}"
                    )));
                }
                Ok(Change {
                    current: vec![current],
                    next: vec![next],
                })
            })
            .await?;
        single(next)
    }

    /// Runs the protocol, re-planning after retryable failures.
    async fn run<P>(&self, op: &'static str, plan: P) -> RangeResult<Vec<RangeDescriptor>>
    where
        P: Fn() -> RangeResult<Change>,
    {
        let mut backoff = self.config.retry_backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let res = match plan() {
                Ok(change) => self.apply(op, change).await,
                Err(err) => Err(err),
            };
            match res {
                Err(err) if err.is_retryable() && attempt <= self.config.max_mutation_retries => {
                    tracing::warn!(op, attempt, error = ?err, "range mutation failed, retrying");
                    if let Some(delay) = backoff.next() {
                        time::sleep(delay).await;
                    }
                }
                res => return res,
            }
        }
    }

    async fn apply(&self, op: &'static str, change: Change) -> RangeResult<Vec<RangeDescriptor>> {
        let mut frozen = Vec::with_capacity(change.current.len());
        for desc in &change.current {
            if let Err(err) = self.freezer.freeze(desc).await {
                self.thaw_back(&frozen).await;
                return Err(err);
            }
            frozen.push(desc.clone());
        }

        if let Err(err) = self.store.transact(|txn| commit_change(txn, &change)) {
            tracing::warn!(op, error = ?err, "range mutation not committed, thawing back");
            self.thaw_back(&frozen).await;
            return Err(err);
        }
        let committed: Vec<_> = change.next.iter().map(ToString::to_string).collect();
        tracing::debug!(op, ranges = ?committed, "range mutation committed");

        let mut stuck = Vec::new();
        let mut joining = change.joining();
        for desc in &change.current {
            let mut replicas = desc.replicas.clone();
            replicas.append(&mut joining);
            match self
                .freezer
                .thaw(desc.range_id, &replicas, &change.next)
                .await
            {
                Ok(()) => {}
                Err(RangeError::StuckFreeze { replicas, .. }) => stuck.extend(replicas),
                Err(err) => return Err(err),
            }
        }
        if !stuck.is_empty() {
            return Err(RangeError::StuckFreeze {
                range_id: change.current.first().map_or(0, |d| d.range_id),
                replicas: stuck,
            });
        }
        Ok(change.next)
    }

    /// Returns frozen replicas to serving their unchanged descriptors.
    async fn thaw_back(&self, descs: &[RangeDescriptor]) {
        for desc in descs {
            if let Err(err) = self
                .freezer
                .thaw(desc.range_id, &desc.replicas, std::slice::from_ref(desc))
                .await
            {
                tracing::error!(range_id = desc.range_id, error = %err, "thaw back failed");
            }
        }
    }
}

fn single(next: Vec<RangeDescriptor>) -> RangeResult<RangeDescriptor> {
    next.into_iter()
        .next()
        .ok_or_else(|| RangeError::CorruptIndex("mutation produced no range".into()))
}
