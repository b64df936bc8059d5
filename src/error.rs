use crate::{
    consistency::Divergence,
    metadata::{NodeId, RangeId, ReplicaDescriptor, StoreId},
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RangeError {
    /// No live range contains the key (or the index is empty).
    #[error("No range contains key {}", .0.escape_ascii())]
    NotFound(Vec<u8>),

    /// Tree and descriptor set diverged.
    #[error("Corrupt range index: {0}")]
    CorruptIndex(String),

    /// Tree already has a node for the key.
    #[error("Duplicate range tree key {}", .0.escape_ascii())]
    DuplicateKey(Vec<u8>),

    /// Backing store transaction conflict.
    #[error("Transaction conflict")]
    Conflict,

    /// Per-replica call exceeded its window.
    #[error("Request to node {node_id} store {store_id} timed out")]
    Timeout { node_id: NodeId, store_id: StoreId },

    /// Replica checksums disagree.
    #[error("Range {range_id} has {} divergent replica(s)", .divergent.len())]
    DataDivergence {
        range_id: RangeId,
        divergent: Vec<Divergence>,
    },

    /// Thaw did not take effect after the descriptor change committed.
    #[error("Range {range_id} left {} replica(s) frozen", .replicas.len())]
    StuckFreeze {
        range_id: RangeId,
        replicas: Vec<ReplicaDescriptor>,
    },

    /// Freeze did not take effect on every required replica.
    #[error("Failed to freeze range {range_id}: {reason}")]
    FreezeFailed { range_id: RangeId, reason: String },

    /// The store holds no replica of the range.
    #[error("Range {range_id} has no replica on store {store_id}")]
    ReplicaNotFound { range_id: RangeId, store_id: StoreId },

    #[error("Invalid range descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Range index is already bootstrapped")]
    AlreadyBootstrapped,

    #[error("Unknown store {0}")]
    UnknownStore(StoreId),

    #[error("Store {0} is already registered")]
    DuplicateStore(StoreId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to decode record: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Backing store failure other than a conflict.
    #[error("Store error: {0}")]
    Store(String),

    /// Remote call failed before producing a response.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl RangeError {
    /// Whether the whole operation may be re-run after re-reading state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict | Self::Timeout { .. })
    }

    /// Structural violations that must halt the enclosing mutation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::CorruptIndex(_) | Self::DuplicateKey(_)
        )
    }
}

pub type RangeResult<T> = Result<T, RangeError>;
