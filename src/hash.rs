use {
    rapidhash::rapidhash,
    serde::{Deserialize, Serialize},
};

/// Index of a fixed hash-space bucket.
pub type Partition = u32;

/// Largest partition power a ring may be built with.
pub const MAX_PART_POWER: u8 = 24;

/// Stable key hasher.
///
/// Keys are hashed together with a cluster-wide prefix and suffix, so that
/// clients cannot predict placement, while the result stays identical on
/// every node sharing the same salts.
///
/// Relies on the rapidhash algorithm, whose output is portable across
/// platforms and releases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathHasher {
    prefix: String,
    suffix: String,
}

impl PathHasher {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// 64-bit hash of a key.
    pub fn hash_key(&self, key: &[u8]) -> u64 {
        let mut buf = Vec::with_capacity(self.prefix.len() + key.len() + self.suffix.len());
        buf.extend_from_slice(self.prefix.as_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(self.suffix.as_bytes());
        rapidhash(&buf)
    }

    /// Partition of a key: the top `part_power` bits of its hash.
    pub fn partition(&self, key: &[u8], part_power: u8) -> Partition {
        partition_of(self.hash_key(key), part_power)
    }
}

/// Maps a 64-bit hash onto one of `2^part_power` partitions.
pub fn partition_of(hash: u64, part_power: u8) -> Partition {
    if part_power == 0 {
        return 0;
    }
    (hash >> (64 - u32::from(part_power))) as Partition
}

/// Stable score of a (partition, device) pair, used to order otherwise equal
/// placement candidates deterministically.
pub(crate) fn pair_score(partition: Partition, device: u16) -> u64 {
    let mut buf = [0u8; 6];
    buf[..4].copy_from_slice(&partition.to_le_bytes());
    buf[4..].copy_from_slice(&device.to_le_bytes());
    rapidhash(&buf)
}

/// Hash of an arbitrary byte string, used for fingerprints.
pub(crate) fn digest(bytes: &[u8]) -> u64 {
    rapidhash(bytes)
}
