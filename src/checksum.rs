use {crate::api::KeyValue, rapidhash_v3::v3::rapidhash_v3};

/// Deterministic checksum over the key-value pairs of a range.
///
/// Pairs are folded in key order: every step hashes the running state
/// together with the length-prefixed key and value, using the rapidhash V3
/// algorithm with its default seed and secrets. The output is portable across
/// platforms and releases, so replicas running different builds agree.
///
/// The checksum is 16 bytes: the folded state followed by the pair count,
/// both big-endian.
#[derive(Debug, Default, Clone)]
pub struct RangeHasher {
    state: u64,
    pairs: u64,
    buf: Vec<u8>,
}

impl RangeHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one pair into the checksum.
    pub fn update(&mut self, key: &[u8], value: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(&self.state.to_le_bytes());
        self.buf.extend_from_slice(&(key.len() as u64).to_le_bytes());
        self.buf.extend_from_slice(key);
        self.buf.extend_from_slice(&(value.len() as u64).to_le_bytes());
        self.buf.extend_from_slice(value);
        self.state = rapidhash_v3(&self.buf);
        self.pairs += 1;
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.state.to_be_bytes());
        out.extend_from_slice(&self.pairs.to_be_bytes());
        out
    }
}

/// Checksum of the pairs, which must be in key order.
pub fn range_checksum(pairs: &[KeyValue]) -> Vec<u8> {
    let mut hasher = RangeHasher::new();
    for kv in pairs {
        hasher.update(&kv.key, &kv.value);
    }
    hasher.finish()
}
