use {
    super::{ObjectMeta, ObjectRecord, ObjectStore, accepts},
    crate::{
        RingResult,
        hash::Partition,
        timestamp::{ConflictPolicy, Timestamp},
    },
    parking_lot::RwLock,
    std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    },
};

type Objects = BTreeMap<Partition, BTreeMap<String, ObjectRecord>>;

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    policy: ConflictPolicy,
    objects: RwLock<Objects>,
    quarantined: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Flips the payload bits of a stored object without touching its
    /// checksum, as bit rot on the device would.
    pub fn corrupt(&self, partition: Partition, name: &str) -> bool {
        let mut objects = self.objects.write();
        let Some(record) = objects.get_mut(&partition).and_then(|p| p.get_mut(name)) else {
            return false;
        };
        if record.payload.is_empty() {
            record.payload.push(0xff);
        } else {
            record.payload.iter_mut().for_each(|b| *b ^= 0xff);
        }
        true
    }

    /// Total number of objects, tombstones included.
    pub fn len(&self) -> usize {
        self.objects.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryStore {
    fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    fn put(&self, partition: Partition, record: ObjectRecord) -> RingResult<bool> {
        record.verify()?;
        let mut objects = self.objects.write();
        let part = objects.entry(partition).or_default();
        let existing = part.get(&record.name).map(ObjectRecord::meta);
        if !accepts(existing.as_ref(), &record.meta(), self.policy) {
            return Ok(false);
        }
        part.insert(record.name.clone(), record);
        Ok(true)
    }

    fn get(&self, partition: Partition, name: &str) -> RingResult<Option<ObjectRecord>> {
        Ok(self
            .objects
            .read()
            .get(&partition)
            .and_then(|p| p.get(name))
            .cloned())
    }

    fn list(&self, partition: Partition) -> RingResult<Vec<ObjectMeta>> {
        Ok(self
            .objects
            .read()
            .get(&partition)
            .map(|p| p.values().map(ObjectRecord::meta).collect())
            .unwrap_or_default())
    }

    fn partitions(&self) -> RingResult<Vec<Partition>> {
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|(_, objects)| !objects.is_empty())
            .map(|(partition, _)| *partition)
            .collect())
    }

    fn audit(&self, partition: Partition) -> RingResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .get(&partition)
            .map(|p| {
                p.values()
                    .filter(|r| r.verify().is_err())
                    .map(|r| r.name.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn quarantine(&self, partition: Partition, name: &str) -> RingResult<()> {
        let removed = self
            .objects
            .write()
            .get_mut(&partition)
            .and_then(|p| p.remove(name));
        if removed.is_some() {
            self.quarantined.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn quarantined(&self) -> usize {
        self.quarantined.load(Ordering::Relaxed)
    }

    fn delete(&self, partition: Partition, name: &str) -> RingResult<bool> {
        Ok(self
            .objects
            .write()
            .get_mut(&partition)
            .and_then(|p| p.remove(name))
            .is_some())
    }

    fn remove_partition(&self, partition: Partition) -> RingResult<()> {
        self.objects.write().remove(&partition);
        Ok(())
    }

    fn reclaim(&self, partition: Partition, age: Duration, now: Timestamp) -> RingResult<usize> {
        let mut objects = self.objects.write();
        let Some(part) = objects.get_mut(&partition) else {
            return Ok(0);
        };
        let before = part.len();
        part.retain(|_, record| !record.meta().is_reclaimable(age, now));
        Ok(before - part.len())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{RingError, timestamp::Version},
    };

    fn record(name: &str, secs: u64, payload: &[u8]) -> ObjectRecord {
        ObjectRecord::new(name, Version::new(Timestamp::from_secs(secs), 0), payload.to_vec())
    }

    #[test]
    fn put_keeps_newest() {
        let store = MemoryStore::new();
        assert!(store.put(3, record("a", 10, b"v1")).unwrap());
        assert!(store.put(3, record("a", 20, b"v2")).unwrap());
        assert!(!store.put(3, record("a", 15, b"stale")).unwrap());
        assert_eq!(store.get(3, "a").unwrap().unwrap().payload, b"v2");

        // A stale write cannot resurrect a delete.
        let tombstone = ObjectRecord::tombstone("a", Version::new(Timestamp::from_secs(30), 0));
        assert!(store.put(3, tombstone).unwrap());
        assert!(!store.put(3, record("a", 25, b"late")).unwrap());
        assert!(store.get(3, "a").unwrap().unwrap().tombstone);

        let mut bad = record("b", 10, b"x");
        bad.checksum ^= 1;
        assert!(matches!(store.put(3, bad), Err(RingError::ChecksumMismatch { .. })));
    }

    #[test]
    fn listing_and_partitions() {
        let store = MemoryStore::new();
        store.put(7, record("b", 1, b"1")).unwrap();
        store.put(7, record("a", 1, b"1")).unwrap();
        store.put(2, record("c", 1, b"1")).unwrap();

        let names: Vec<String> = store.list(7).unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(store.partitions().unwrap(), vec![2, 7]);
        assert!(store.list(9).unwrap().is_empty());

        assert!(store.delete(2, "c").unwrap());
        assert!(!store.delete(2, "c").unwrap());
        assert_eq!(store.partitions().unwrap(), vec![7]);

        store.remove_partition(7).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn audit_and_quarantine() {
        let store = MemoryStore::new();
        store.put(1, record("good", 1, b"data")).unwrap();
        store.put(1, record("rotten", 1, b"data")).unwrap();
        assert!(store.corrupt(1, "rotten"));
        assert!(!store.corrupt(1, "missing"));

        assert_eq!(store.audit(1).unwrap(), vec!["rotten".to_string()]);
        store.quarantine(1, "rotten").unwrap();
        assert_eq!(store.quarantined(), 1);
        assert!(store.get(1, "rotten").unwrap().is_none());
        assert!(store.audit(1).unwrap().is_empty());
    }

    #[test]
    fn reclaim_old_tombstones() {
        let store = MemoryStore::new();
        let deleted = |secs| ObjectRecord::tombstone(format!("t{secs}"), Version::new(Timestamp::from_secs(secs), 0));
        store.put(0, deleted(100)).unwrap();
        store.put(0, deleted(900)).unwrap();
        store.put(0, record("live", 100, b"x")).unwrap();

        let purged = store
            .reclaim(0, Duration::from_secs(500), Timestamp::from_secs(1000))
            .unwrap();
        assert_eq!(purged, 1);
        let names: Vec<String> = store.list(0).unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["live", "t900"]);
    }
}
