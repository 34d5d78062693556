pub mod disk;
pub mod memory;

use {
    crate::{
        RingError,
        RingResult,
        hash::Partition,
        timestamp::{ConflictPolicy, Timestamp, Version},
    },
    auto_impl::auto_impl,
    serde::{Deserialize, Serialize},
    std::{cmp::Ordering, time::Duration},
};

pub use {disk::DiskStore, memory::MemoryStore};

/// Stored object: payload plus the metadata needed to order and verify it.
///
/// A delete is stored as a tombstone with an empty payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub name: String,
    pub version: Version,
    pub tombstone: bool,
    pub payload: Vec<u8>,
    /// CRC32C of the payload.
    pub checksum: u32,
}

impl ObjectRecord {
    pub fn new(name: impl Into<String>, version: Version, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        Self {
            name: name.into(),
            version,
            tombstone: false,
            checksum: crc32c::crc32c(&payload),
            payload,
        }
    }

    pub fn tombstone(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            tombstone: true,
            payload: Vec::new(),
            checksum: crc32c::crc32c(&[]),
        }
    }

    /// Checks the payload against the recorded checksum.
    pub fn verify(&self) -> RingResult<()> {
        let actual = crc32c::crc32c(&self.payload);
        if actual != self.checksum {
            return Err(RingError::ChecksumMismatch {
                name: self.name.clone(),
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    pub fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: self.name.clone(),
            version: self.version,
            tombstone: self.tombstone,
        }
    }
}

/// Listing entry: what a replica holds, without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub version: Version,
    pub tombstone: bool,
}

impl ObjectMeta {
    /// Whether this version strictly supersedes `other` under `policy`.
    pub fn supersedes(&self, other: &ObjectMeta, policy: ConflictPolicy) -> bool {
        policy.compare((&self.version, self.tombstone), (&other.version, other.tombstone))
            == Ordering::Greater
    }

    /// Tombstone old enough to be purged.
    pub fn is_reclaimable(&self, age: Duration, now: Timestamp) -> bool {
        self.tombstone && self.version.timestamp.older_than(age, now)
    }
}

/// Local object storage of one device, organized by partition.
#[auto_impl(&, Arc, Box)]
pub trait ObjectStore: Send + Sync {
    /// Conflict policy applied by [`put`](Self::put).
    fn policy(&self) -> ConflictPolicy;

    /// Stores the record unless an equal or newer version is already held.
    ///
    /// Returns whether the record was stored. Records failing checksum
    /// verification are rejected.
    fn put(&self, partition: Partition, record: ObjectRecord) -> RingResult<bool>;

    fn get(&self, partition: Partition, name: &str) -> RingResult<Option<ObjectRecord>>;

    /// Objects of a partition, ordered by name.
    fn list(&self, partition: Partition) -> RingResult<Vec<ObjectMeta>>;

    /// Partitions holding at least one object, ascending.
    fn partitions(&self) -> RingResult<Vec<Partition>>;

    /// Re-verifies every object of the partition, returning the names of
    /// those whose content no longer matches its checksum.
    fn audit(&self, partition: Partition) -> RingResult<Vec<String>>;

    /// Moves an object out of the partition, so that it is neither served
    /// nor replicated. The next sync fetches a good copy from a peer.
    fn quarantine(&self, partition: Partition, name: &str) -> RingResult<()>;

    /// Number of objects quarantined so far.
    fn quarantined(&self) -> usize;

    /// Physically removes an object. Returns whether it existed.
    fn delete(&self, partition: Partition, name: &str) -> RingResult<bool>;

    /// Physically removes a whole partition.
    fn remove_partition(&self, partition: Partition) -> RingResult<()>;

    /// Purges tombstones older than `age`, returning how many were purged.
    fn reclaim(&self, partition: Partition, age: Duration, now: Timestamp) -> RingResult<usize>;
}

/// Whether `incoming` replaces `existing` under `policy`.
pub(crate) fn accepts(
    existing: Option<&ObjectMeta>,
    incoming: &ObjectMeta,
    policy: ConflictPolicy,
) -> bool {
    existing.is_none_or(|existing| incoming.supersedes(existing, policy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records() {
        let version = Version::new(Timestamp::from_secs(100), 1);
        let mut record = ObjectRecord::new("a/c/o", version, b"hello".to_vec());
        assert!(record.verify().is_ok());
        assert_eq!(record.checksum, crc32c::crc32c(b"hello"));

        record.payload[0] ^= 0xff;
        assert!(matches!(
            record.verify(),
            Err(RingError::ChecksumMismatch { ref name, .. }) if name == "a/c/o"
        ));

        let tombstone = ObjectRecord::tombstone("a/c/o", version);
        assert!(tombstone.verify().is_ok());
        assert!(tombstone.meta().tombstone);

        let now = Timestamp::from_secs(1000);
        assert!(tombstone.meta().is_reclaimable(Duration::from_secs(60), now));
        assert!(!tombstone.meta().is_reclaimable(Duration::from_secs(3600), now));
        assert!(!record.meta().is_reclaimable(Duration::from_secs(60), now));
    }

    #[test]
    fn last_write_wins() {
        let policy = ConflictPolicy::TimestampThenOrigin;
        let old = ObjectRecord::new("k", Version::new(Timestamp::from_secs(1), 9), b"v1".to_vec());
        let new = ObjectRecord::new("k", Version::new(Timestamp::from_secs(2), 0), b"v2".to_vec());

        assert!(accepts(None, &old.meta(), policy));
        assert!(accepts(Some(&old.meta()), &new.meta(), policy));
        assert!(!accepts(Some(&new.meta()), &old.meta(), policy));
        assert!(!accepts(Some(&new.meta()), &new.meta(), policy));
    }
}
