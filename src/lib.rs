//! Range placement index and replica consistency checks for a
//! range-partitioned key-value store.
//!
//! The keyspace `[KEY_MIN, KEY_MAX)` is split into contiguous ranges, each
//! described by a [`RangeDescriptor`] and replicated across stores. The
//! descriptors are indexed by a red-black tree ([`RangeTreeTxn`]) persisted
//! in the very store it describes, with nodes linked by key. Ranges are
//! split, merged and re-membered by a [`RangeManager`], which freezes the
//! affected replicas around each committed change. A [`ConsistencyChecker`]
//! compares replica checksums and reports divergence.

pub mod api;
pub mod checksum;
pub mod config;
pub mod consistency;
pub mod directory;
mod error;
pub mod fanout;
pub mod freeze;
pub mod keys;
pub mod metadata;
pub mod mutation;
pub mod replica;
pub mod store;
pub mod tree;

pub use {
    api::ReplicaTransport,
    config::{CompletionPolicy, CoordinatorConfig},
    consistency::{CheckOptions, ConsistencyChecker, ConsistencyReport, Divergence},
    directory::StoreDirectory,
    error::{RangeError, RangeResult},
    freeze::FreezeCoordinator,
    metadata::{
        KEY_MAX,
        KEY_MIN,
        NodeId,
        RangeDescriptor,
        RangeId,
        ReplicaDescriptor,
        ReplicaId,
        StoreId,
    },
    mutation::RangeManager,
    replica::StoreReplicas,
    store::{MemStore, RangeEngine, Store, Txn, TxnExt},
    tree::{RangeTreeTxn, TreeShape},
};
