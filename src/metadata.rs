//! Descriptive records shared by the range index, the freeze coordinator and
//! the consistency checker.
//!
//! The records are protobuf messages with stable field numbers: replicas of
//! different versions exchange them during rolling upgrades, so decoders skip
//! fields they do not recognize.

use {
    crate::{RangeError, RangeResult},
    std::fmt,
};

pub type NodeId = i32;
pub type StoreId = i32;
pub type RangeId = i64;
pub type ReplicaId = i32;

/// Lowest key of the keyspace.
pub const KEY_MIN: &[u8] = b"";

/// Upper bound of the keyspace, stands for +inf as a range end key.
pub const KEY_MAX: &[u8] = b"\xff\xff";

/// Free-form capability tags (topology, device type, machine traits).
///
/// Order is preserved but carries no ranking semantics.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct Attributes {
    #[prost(string, repeated, tag = "1")]
    pub attrs: Vec<String>,
}

impl Attributes {
    pub fn new<I, S>(attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attrs: attrs.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether every tag is also present in `other`.
    pub fn is_subset_of(&self, other: &Attributes) -> bool {
        self.attrs.iter().all(|a| other.attrs.contains(a))
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.attrs.join(","))
    }
}

/// One copy of a range, located by node and store.
///
/// `replica_id` is issued by the range: a replica removed from a store and
/// later re-added to it gets a strictly larger id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, prost::Message)]
pub struct ReplicaDescriptor {
    #[prost(int32, tag = "1")]
    pub node_id: NodeId,
    #[prost(int32, tag = "2")]
    pub store_id: StoreId,
    #[prost(int32, tag = "3")]
    pub replica_id: ReplicaId,
}

impl ReplicaDescriptor {
    pub fn new(node_id: NodeId, store_id: StoreId, replica_id: ReplicaId) -> Self {
        Self {
            node_id,
            store_id,
            replica_id,
        }
    }

    /// Whether both descriptors point at the same store of the same node.
    pub fn same_location(&self, other: &ReplicaDescriptor) -> bool {
        self.node_id == other.node_id && self.store_id == other.store_id
    }
}

/// Range metadata record: `[start_key, end_key)` and the stores holding it.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct RangeDescriptor {
    #[prost(int64, tag = "1")]
    pub range_id: RangeId,
    #[prost(bytes = "vec", tag = "2")]
    pub start_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub end_key: Vec<u8>,
    /// Replica set; ordering is arbitrary.
    #[prost(message, repeated, tag = "4")]
    pub replicas: Vec<ReplicaDescriptor>,
    /// Source of replica ids for this range's lineage.
    #[prost(int32, tag = "5")]
    pub next_replica_id: ReplicaId,
}

impl RangeDescriptor {
    /// Creates a descriptor with no replicas.
    pub fn new(range_id: RangeId, start_key: &[u8], end_key: &[u8]) -> Self {
        Self {
            range_id,
            start_key: start_key.to_vec(),
            end_key: end_key.to_vec(),
            replicas: Vec::new(),
            next_replica_id: 1,
        }
    }

    /// Whether the key falls into `[start_key, end_key)`.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.start_key.as_slice() <= key && key < self.end_key.as_slice()
    }

    /// Whether `[start, end)` lies entirely within the range.
    pub fn contains_key_range(&self, start: &[u8], end: &[u8]) -> bool {
        self.start_key.as_slice() <= start && start < end && end <= self.end_key.as_slice()
    }

    /// Checks the per-descriptor invariants.
    pub fn validate(&self) -> RangeResult<()> {
        if self.start_key >= self.end_key {
            return Err(RangeError::InvalidDescriptor(format!(
                "range {} has empty span [{}, {})",
                self.range_id,
                self.start_key.escape_ascii(),
                self.end_key.escape_ascii()
            )));
        }
        for (i, replica) in self.replicas.iter().enumerate() {
            if self.replicas[..i].iter().any(|r| r.same_location(replica)) {
                return Err(RangeError::InvalidDescriptor(format!(
                    "range {} has two replicas on node {} store {}",
                    self.range_id, replica.node_id, replica.store_id
                )));
            }
            if replica.replica_id >= self.next_replica_id {
                return Err(RangeError::InvalidDescriptor(format!(
                    "range {} replica id {} is not below next replica id {}",
                    self.range_id, replica.replica_id, self.next_replica_id
                )));
            }
        }
        Ok(())
    }

    pub fn find_replica(&self, node_id: NodeId, store_id: StoreId) -> Option<&ReplicaDescriptor> {
        self.replicas
            .iter()
            .find(|r| r.node_id == node_id && r.store_id == store_id)
    }

    /// Adds a replica on the given store, issuing the next replica id.
    pub fn add_replica(
        &mut self,
        node_id: NodeId,
        store_id: StoreId,
    ) -> RangeResult<ReplicaDescriptor> {
        if self.find_replica(node_id, store_id).is_some() {
            return Err(RangeError::InvalidDescriptor(format!(
                "range {} already has a replica on node {node_id} store {store_id}",
                self.range_id
            )));
        }
        let replica = ReplicaDescriptor::new(node_id, store_id, self.next_replica_id);
        self.next_replica_id += 1;
        self.replicas.push(replica);
        Ok(replica)
    }

    /// Removes and returns the replica on the given store, if any.
    ///
    /// The id counter is left untouched, so the id is never reissued.
    pub fn remove_replica(
        &mut self,
        node_id: NodeId,
        store_id: StoreId,
    ) -> Option<ReplicaDescriptor> {
        let pos = self
            .replicas
            .iter()
            .position(|r| r.node_id == node_id && r.store_id == store_id)?;
        Some(self.replicas.swap_remove(pos))
    }

    /// Splits the range at `split_key` into two ranges with fresh ids.
    ///
    /// Both halves keep the replica set and inherit the id counter.
    pub fn split(
        &self,
        split_key: &[u8],
        left_id: RangeId,
        right_id: RangeId,
    ) -> RangeResult<(RangeDescriptor, RangeDescriptor)> {
        if split_key <= self.start_key.as_slice() || split_key >= self.end_key.as_slice() {
            return Err(RangeError::InvalidDescriptor(format!(
                "split key {} is not inside range {}",
                split_key.escape_ascii(),
                self
            )));
        }
        if left_id <= self.range_id || right_id <= self.range_id || left_id == right_id {
            return Err(RangeError::InvalidDescriptor(format!(
                "split of range {} needs two fresh larger ids, got {left_id} and {right_id}",
                self.range_id
            )));
        }

        let left = RangeDescriptor {
            range_id: left_id,
            end_key: split_key.to_vec(),
            ..self.clone()
        };
        let right = RangeDescriptor {
            range_id: right_id,
            start_key: split_key.to_vec(),
            ..self.clone()
        };
        Ok((left, right))
    }

    /// Combines two adjacent ranges into one.
    ///
    /// Both ranges must live on the same stores. The left side's replica ids
    /// are kept, and the id counter continues from the larger of the two.
    pub fn merge(
        left: &RangeDescriptor,
        right: &RangeDescriptor,
        range_id: RangeId,
    ) -> RangeResult<RangeDescriptor> {
        if left.end_key != right.start_key {
            return Err(RangeError::InvalidDescriptor(format!(
                "ranges {left} and {right} are not adjacent"
            )));
        }
        let colocated = left.replicas.len() == right.replicas.len()
            && left
                .replicas
                .iter()
                .all(|l| right.replicas.iter().any(|r| r.same_location(l)));
        if !colocated {
            return Err(RangeError::InvalidDescriptor(format!(
                "ranges {} and {} are not colocated",
                left.range_id, right.range_id
            )));
        }

        Ok(RangeDescriptor {
            range_id,
            start_key: left.start_key.clone(),
            end_key: right.end_key.clone(),
            replicas: left.replicas.clone(),
            next_replica_id: left.next_replica_id.max(right.next_replica_id),
        })
    }
}

impl fmt::Display for RangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r{}:[{}, {})",
            self.range_id,
            self.start_key.escape_ascii(),
            self.end_key.escape_ascii()
        )
    }
}

/// Root record of the range tree.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct RangeTree {
    /// Absent for an empty tree.
    #[prost(bytes = "vec", optional, tag = "1")]
    pub root_key: Option<Vec<u8>>,
}

/// Node of the red-black tree indexing range start keys.
///
/// Links hold the key of the neighbouring node. The empty key is a valid
/// node key (the first range starts at it), so an absent link is `None`.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct RangeTreeNode {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    /// Black if true, red if false.
    #[prost(bool, tag = "2")]
    pub black: bool,
    /// Absent for the root.
    #[prost(bytes = "vec", optional, tag = "3")]
    pub parent_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub left_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub right_key: Option<Vec<u8>>,
}

impl RangeTreeNode {
    /// A fresh red leaf.
    pub fn leaf(key: &[u8], parent_key: Option<Vec<u8>>) -> Self {
        Self {
            key: key.to_vec(),
            black: false,
            parent_key,
            left_key: None,
            right_key: None,
        }
    }
}

/// Capacity information of a storage device.
#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct StoreCapacity {
    #[prost(int64, tag = "1")]
    pub capacity: i64,
    #[prost(int64, tag = "2")]
    pub available: i64,
    #[prost(int32, tag = "3")]
    pub range_count: i32,
}

impl StoreCapacity {
    /// Used share of the device in `[0, 1]`; zero when capacity is unknown.
    pub fn fraction_used(&self) -> f64 {
        if self.capacity <= 0 {
            return 0.0;
        }
        let used = (self.capacity - self.available).clamp(0, self.capacity);
        used as f64 / self.capacity as f64
    }
}

/// Network address, unresolved until a connection is made.
#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct UnresolvedAddr {
    #[prost(string, tag = "1")]
    pub network_field: String,
    #[prost(string, tag = "2")]
    pub address_field: String,
}

impl UnresolvedAddr {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network_field: "tcp".to_string(),
            address_field: address.into(),
        }
    }
}

/// Physical and network topology of a node.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct NodeDescriptor {
    #[prost(int32, tag = "1")]
    pub node_id: NodeId,
    #[prost(message, optional, tag = "2")]
    pub address: Option<UnresolvedAddr>,
    #[prost(message, optional, tag = "3")]
    pub attrs: Option<Attributes>,
}

/// Store information as published by the discovery layer.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct StoreDescriptor {
    #[prost(int32, tag = "1")]
    pub store_id: StoreId,
    #[prost(message, optional, tag = "2")]
    pub attrs: Option<Attributes>,
    #[prost(message, optional, tag = "3")]
    pub node: Option<NodeDescriptor>,
    #[prost(message, optional, tag = "4")]
    pub capacity: Option<StoreCapacity>,
}

impl StoreDescriptor {
    pub fn node_id(&self) -> NodeId {
        self.node.as_ref().map_or(0, |n| n.node_id)
    }

    /// Node attributes followed by store attributes.
    pub fn combined_attrs(&self) -> Attributes {
        let node_attrs = self.node.as_ref().and_then(|n| n.attrs.as_ref());
        Attributes {
            attrs: node_attrs
                .into_iter()
                .chain(self.attrs.as_ref())
                .flat_map(|a| a.attrs.iter().cloned())
                .collect(),
        }
    }
}
