//! Reserved keys of the range metadata records.
//!
//! Metadata lives in the same store as the data it indexes, under the
//! `\x00\x00meta` prefix which sorts below ordinary user keys.

/// Prefix shared by every metadata record.
pub const META_PREFIX: &[u8] = b"\x00\x00meta";

/// Prefix of range descriptor records, followed by the range start key.
pub const RANGE_DESCRIPTOR_PREFIX: &[u8] = b"\x00\x00meta-rdsc/";

/// Prefix of range tree node records, followed by the node key.
pub const RANGE_TREE_NODE_PREFIX: &[u8] = b"\x00\x00meta-rtn/";

/// Holds the `RangeTree` root record.
pub const RANGE_TREE_ROOT_KEY: &[u8] = b"\x00\x00meta-rtree";

/// Holds the last issued range id.
pub const RANGE_ID_GENERATOR_KEY: &[u8] = b"\x00\x00meta-range-idgen";

fn prefixed(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + key.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(key);
    out
}

/// Key of the descriptor of the range starting at `start_key`.
pub fn range_descriptor_key(start_key: &[u8]) -> Vec<u8> {
    prefixed(RANGE_DESCRIPTOR_PREFIX, start_key)
}

/// Key of the tree node indexing `key`.
pub fn range_tree_node_key(key: &[u8]) -> Vec<u8> {
    prefixed(RANGE_TREE_NODE_PREFIX, key)
}

/// Whether the key belongs to the metadata keyspace.
pub fn is_meta_key(key: &[u8]) -> bool {
    key.starts_with(META_PREFIX)
}
