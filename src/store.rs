//! Backing store capabilities.
//!
//! The range index is expressed as keyed reads and writes inside a
//! transaction; isolation and conflict detection belong to the store.
//! [`MemStore`] is an in-memory store with optimistic serializable
//! transactions.

use {
    crate::{RangeError, RangeResult, api::KeyValue},
    auto_impl::auto_impl,
    parking_lot::RwLock,
    prost::Message,
    rapidhash::RapidBuildHasher,
    std::{
        collections::{BTreeMap, HashMap, btree_map::Entry},
        ops::Bound,
        sync::Arc,
    },
};

/// Keyed read-modify-write access within one transaction.
#[auto_impl(&mut, Box)]
pub trait Txn {
    /// Reads the value stored at the key.
    fn get(&mut self, key: &[u8]) -> RangeResult<Option<Vec<u8>>>;

    /// Writes the value at the key.
    fn put(&mut self, key: &[u8], value: Vec<u8>) -> RangeResult<()>;

    /// Deletes the key, if present.
    fn delete(&mut self, key: &[u8]) -> RangeResult<()>;
}

/// Typed record access on top of [`Txn`].
pub trait TxnExt: Txn {
    fn get_message<M: Message + Default>(&mut self, key: &[u8]) -> RangeResult<Option<M>> {
        self.get(key)?
            .map(|bytes| M::decode(bytes.as_slice()).map_err(RangeError::from))
            .transpose()
    }

    fn put_message<M: Message>(&mut self, key: &[u8], msg: &M) -> RangeResult<()> {
        self.put(key, msg.encode_to_vec())
    }
}

impl<T: Txn + ?Sized> TxnExt for T {}

/// Transactional store.
pub trait Store: Send + Sync {
    type Txn: Txn;

    /// Starts a transaction.
    fn begin(&self) -> Self::Txn;

    /// Commits the transaction atomically.
    ///
    /// Returns [`RangeError::Conflict`] if a concurrent transaction changed
    /// anything this one read.
    fn commit(&self, txn: Self::Txn) -> RangeResult<()>;

    /// Runs `f` in a fresh transaction and commits it if `f` succeeds.
    ///
    /// Nothing is written when `f` fails.
    fn transact<T, F>(&self, f: F) -> RangeResult<T>
    where
        F: FnOnce(&mut Self::Txn) -> RangeResult<T>,
        Self: Sized,
    {
        let mut txn = self.begin();
        let out = f(&mut txn)?;
        self.commit(txn)?;
        Ok(out)
    }
}

/// Ordered read access to the key-value pairs of a replica.
#[auto_impl(&, Arc)]
pub trait RangeEngine: Send + Sync {
    /// Returns every pair in `[start, end)` in key order.
    fn scan(&self, start: &[u8], end: &[u8]) -> RangeResult<Vec<KeyValue>>;
}

#[derive(Debug, Clone)]
struct Versioned {
    version: u64,
    value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct MemInner {
    /// Write history per key, oldest first.
    data: BTreeMap<Vec<u8>, Vec<Versioned>>,
    version: u64,
    /// Snapshot versions of open transactions, with their counts.
    readers: BTreeMap<u64, usize>,
}

impl MemInner {
    fn latest(&self, key: &[u8]) -> Option<&Versioned> {
        self.data.get(key)?.last()
    }

    /// Value of the key as of the snapshot at `version`.
    fn read_at(&self, key: &[u8], version: u64) -> Option<&Versioned> {
        self.data.get(key)?.iter().rev().find(|v| v.version <= version)
    }

    /// Oldest version any open transaction can still read.
    fn horizon(&self) -> u64 {
        self.readers.keys().next().copied().unwrap_or(self.version)
    }

    fn release(&mut self, snapshot: u64) {
        if let Entry::Occupied(mut entry) = self.readers.entry(snapshot) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }
}

/// In-memory ordered store with optimistic snapshot transactions.
///
/// Every key keeps the versions written to it (deletes leave a tombstone)
/// for as long as an open transaction may read them. A transaction reads
/// the state as of its `begin`, records the version of every key it reads
/// and buffers its writes; commit fails with a conflict if any read key
/// changed in the meantime. Read-only transactions always commit.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    inner: Arc<RwLock<MemInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest committed value of the key.
    pub fn read(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.read().latest(key).and_then(|v| v.value.clone())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .data
            .values()
            .filter(|history| history.last().is_some_and(|v| v.value.is_some()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transaction of a [`MemStore`].
pub struct MemTxn {
    inner: Arc<RwLock<MemInner>>,
    snapshot: u64,
    /// Whether `snapshot` still counts as an open reader.
    open: bool,
    reads: HashMap<Vec<u8>, u64, RapidBuildHasher>,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl MemTxn {
    /// Whether the transaction has buffered no writes.
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }
}

impl Txn for MemTxn {
    fn get(&mut self, key: &[u8]) -> RangeResult<Option<Vec<u8>>> {
        if let Some(value) = self.writes.get(key) {
            return Ok(value.clone());
        }
        let inner = self.inner.read();
        let (version, value) = inner
            .read_at(key, self.snapshot)
            .map_or((0, None), |v| (v.version, v.value.clone()));
        self.reads.entry(key.to_vec()).or_insert(version);
        Ok(value)
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> RangeResult<()> {
        self.writes.insert(key.to_vec(), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> RangeResult<()> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }
}

impl Drop for MemTxn {
    fn drop(&mut self) {
        if self.open {
            self.inner.write().release(self.snapshot);
        }
    }
}

impl Store for MemStore {
    type Txn = MemTxn;

    fn begin(&self) -> MemTxn {
        let mut inner = self.inner.write();
        let snapshot = inner.version;
        *inner.readers.entry(snapshot).or_default() += 1;
        MemTxn {
            inner: self.inner.clone(),
            snapshot,
            open: true,
            reads: HashMap::default(),
            writes: BTreeMap::new(),
        }
    }

    fn commit(&self, mut txn: MemTxn) -> RangeResult<()> {
        if txn.is_read_only() {
            return Ok(());
        }
        let writes = std::mem::take(&mut txn.writes);

        let mut inner = self.inner.write();
        let stale = txn.reads.iter().any(|(key, seen)| {
            let current = inner.latest(key).map_or(0, |v| v.version);
            current != *seen
        });
        if stale {
            return Err(RangeError::Conflict);
        }

        inner.release(txn.snapshot);
        txn.open = false;
        inner.version += 1;
        let version = inner.version;
        let horizon = inner.horizon();
        for (key, value) in writes {
            let history = inner.data.entry(key).or_default();
            history.push(Versioned { version, value });
            let visible = history
                .iter()
                .rposition(|v| v.version <= horizon)
                .unwrap_or(0);
            history.drain(..visible);
        }
        Ok(())
    }
}

impl RangeEngine for MemStore {
    fn scan(&self, start: &[u8], end: &[u8]) -> RangeResult<Vec<KeyValue>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();
        let range = inner
            .data
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)));
        Ok(range
            .filter_map(|(key, history)| {
                let value = history.last()?.value.as_ref()?;
                Some(KeyValue {
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect())
    }
}
