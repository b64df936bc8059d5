//! Replica-facing requests and responses.
//!
//! Field numbers are part of the wire contract and must never be reused.

use {
    crate::{
        RangeResult,
        metadata::{NodeId, RangeDescriptor, RangeId, ReplicaDescriptor, StoreDescriptor, StoreId},
    },
    async_trait::async_trait,
};

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct KeyValue {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Raw content of a range, captured for forensic comparison.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct RangeSnapshot {
    #[prost(message, optional, tag = "1")]
    pub descriptor: Option<RangeDescriptor>,
    #[prost(message, repeated, tag = "2")]
    pub pairs: Vec<KeyValue>,
}

#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct PollFrozenRequest {
    #[prost(int32, tag = "1")]
    pub node_id: NodeId,
    #[prost(int32, tag = "2")]
    pub store_id: StoreId,
    /// Collect frozen replicas if true, thawed ones otherwise.
    #[prost(bool, tag = "3")]
    pub collect_frozen: bool,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct PollFrozenResponse {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<ReplicaDescriptor>,
}

/// Pauses or resumes mutation of one replica.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct ChangeFrozenRequest {
    #[prost(int32, tag = "1")]
    pub node_id: NodeId,
    #[prost(int32, tag = "2")]
    pub store_id: StoreId,
    #[prost(int64, tag = "3")]
    pub range_id: RangeId,
    #[prost(bool, tag = "4")]
    pub frozen: bool,
    /// On thaw: the descriptors the replica serves from now on. A replica
    /// whose store is in none of them is being removed.
    #[prost(message, repeated, tag = "5")]
    pub descriptors: Vec<RangeDescriptor>,
}

#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct ChangeFrozenResponse {
    #[prost(bool, tag = "1")]
    pub frozen: bool,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct CollectChecksumRequest {
    #[prost(int32, tag = "1")]
    pub node_id: NodeId,
    #[prost(int32, tag = "2")]
    pub store_id: StoreId,
    #[prost(int64, tag = "3")]
    pub range_id: RangeId,
    /// 16-byte identifier of the checksum computation.
    #[prost(bytes = "vec", tag = "4")]
    pub checksum_id: Vec<u8>,
    /// Requester's checksum; empty when the requester has none yet.
    #[prost(bytes = "vec", tag = "5")]
    pub checksum: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct CollectChecksumResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub checksum: Vec<u8>,
    /// Present when the checksum differs from the requester's.
    #[prost(message, optional, tag = "2")]
    pub snapshot: Option<RangeSnapshot>,
}

/// Transport to the replicas hosted by a store.
///
/// Implementations deliver the request to `target` (addressed through its
/// node descriptor) and return the decoded response.
#[async_trait]
pub trait ReplicaTransport: Send + Sync + 'static {
    async fn poll_frozen(
        &self,
        target: &StoreDescriptor,
        req: PollFrozenRequest,
    ) -> RangeResult<PollFrozenResponse>;

    async fn change_frozen(
        &self,
        target: &StoreDescriptor,
        req: ChangeFrozenRequest,
    ) -> RangeResult<ChangeFrozenResponse>;

    async fn collect_checksum(
        &self,
        target: &StoreDescriptor,
        req: CollectChecksumRequest,
    ) -> RangeResult<CollectChecksumResponse>;
}
