use {
    super::{ObjectMeta, ObjectRecord, ObjectStore, accepts},
    crate::{
        RingResult,
        hash::{Partition, digest},
        ring::write_atomic,
        timestamp::{ConflictPolicy, Timestamp},
    },
    parking_lot::Mutex,
    std::{
        fs,
        io,
        path::{Path, PathBuf},
        time::Duration,
    },
    tracing::warn,
};

const OBJECTS_DIR: &str = "objects";
const QUARANTINE_DIR: &str = "quarantined";
const DATA_EXT: &str = "data";

/// Filesystem object store.
///
/// Layout: `objects/<partition>/<name hash>.data`, one bincode-encoded
/// [`ObjectRecord`] per file. Files are written under a temporary name and
/// renamed into place, so a partially written object is never visible.
/// Quarantined files are moved to `quarantined/`.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    policy: ConflictPolicy,
    /// Serializes the read-compare-write of `put` and moves between
    /// directories.
    write_lock: Mutex<()>,
}

impl DiskStore {
    pub fn open(root: impl AsRef<Path>, policy: ConflictPolicy) -> RingResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        fs::create_dir_all(root.join(QUARANTINE_DIR))?;
        Ok(Self {
            root,
            policy,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, partition: Partition) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(partition.to_string())
    }

    fn object_path(&self, partition: Partition, name: &str) -> PathBuf {
        self.partition_dir(partition)
            .join(format!("{:016x}.{DATA_EXT}", digest(name.as_bytes())))
    }

    fn read_record(path: &Path) -> RingResult<Option<ObjectRecord>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Data files of a partition; temporary files are skipped.
    fn data_files(&self, partition: Partition) -> RingResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(self.partition_dir(partition)) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == DATA_EXT) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn move_to_quarantine(&self, partition: Partition, path: &Path) -> RingResult<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = self
            .root
            .join(QUARANTINE_DIR)
            .join(format!("{partition}-{file_name}"));
        fs::rename(path, target)?;
        Ok(())
    }
}

impl ObjectStore for DiskStore {
    fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    fn put(&self, partition: Partition, record: ObjectRecord) -> RingResult<bool> {
        record.verify()?;
        let path = self.object_path(partition, &record.name);

        let _guard = self.write_lock.lock();
        let existing = Self::read_record(&path)?.map(|r| r.meta());
        if !accepts(existing.as_ref(), &record.meta(), self.policy) {
            return Ok(false);
        }
        fs::create_dir_all(self.partition_dir(partition))?;
        write_atomic(&path, &bincode::serialize(&record)?)?;
        Ok(true)
    }

    fn get(&self, partition: Partition, name: &str) -> RingResult<Option<ObjectRecord>> {
        let record = Self::read_record(&self.object_path(partition, name))?;
        Ok(record.filter(|r| r.name == name))
    }

    fn list(&self, partition: Partition) -> RingResult<Vec<ObjectMeta>> {
        let mut metas = Vec::new();
        for path in self.data_files(partition)? {
            match Self::read_record(&path) {
                Ok(Some(record)) => metas.push(record.meta()),
                Ok(None) => {}
                Err(err) => warn!(%err, path = %path.display(), "unreadable object skipped"),
            }
        }
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(metas)
    }

    fn partitions(&self) -> RingResult<Vec<Partition>> {
        let mut partitions = Vec::new();
        for entry in fs::read_dir(self.root.join(OBJECTS_DIR))? {
            let entry = entry?;
            let Some(partition) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.parse::<Partition>().ok())
            else {
                continue;
            };
            if !self.data_files(partition)?.is_empty() {
                partitions.push(partition);
            }
        }
        partitions.sort_unstable();
        Ok(partitions)
    }

    /// Undecodable files cannot be named; they are quarantined right away.
    fn audit(&self, partition: Partition) -> RingResult<Vec<String>> {
        let mut failed = Vec::new();
        for path in self.data_files(partition)? {
            match Self::read_record(&path) {
                Ok(Some(record)) if record.verify().is_err() => failed.push(record.name),
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, path = %path.display(), "undecodable object quarantined");
                    let _guard = self.write_lock.lock();
                    self.move_to_quarantine(partition, &path)?;
                }
            }
        }
        Ok(failed)
    }

    fn quarantine(&self, partition: Partition, name: &str) -> RingResult<()> {
        let path = self.object_path(partition, name);
        let _guard = self.write_lock.lock();
        if path.exists() {
            self.move_to_quarantine(partition, &path)?;
        }
        Ok(())
    }

    fn quarantined(&self) -> usize {
        fs::read_dir(self.root.join(QUARANTINE_DIR))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    fn delete(&self, partition: Partition, name: &str) -> RingResult<bool> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(self.object_path(partition, name)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn remove_partition(&self, partition: Partition) -> RingResult<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_dir_all(self.partition_dir(partition)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn reclaim(&self, partition: Partition, age: Duration, now: Timestamp) -> RingResult<usize> {
        let mut purged = 0;
        let _guard = self.write_lock.lock();
        for path in self.data_files(partition)? {
            if let Ok(Some(record)) = Self::read_record(&path) {
                if record.meta().is_reclaimable(age, now) {
                    fs::remove_file(&path)?;
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::timestamp::Version};

    fn record(name: &str, secs: u64, payload: &[u8]) -> ObjectRecord {
        ObjectRecord::new(name, Version::new(Timestamp::from_secs(secs), 0), payload.to_vec())
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path(), ConflictPolicy::default()).unwrap();
            assert!(store.put(4, record("a/c/o1", 10, b"one")).unwrap());
            assert!(store.put(4, record("a/c/o2", 10, b"two")).unwrap());
            assert!(store.put(9, record("a/c/o3", 10, b"three")).unwrap());
            assert!(!store.put(4, record("a/c/o1", 5, b"old")).unwrap());
        }

        let store = DiskStore::open(dir.path(), ConflictPolicy::default()).unwrap();
        assert_eq!(store.partitions().unwrap(), vec![4, 9]);
        assert_eq!(store.get(4, "a/c/o1").unwrap().unwrap().payload, b"one");
        assert!(store.get(9, "a/c/o1").unwrap().is_none());
        let names: Vec<String> = store.list(4).unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a/c/o1", "a/c/o2"]);

        // No temporary files are left behind.
        let leftovers = fs::read_dir(store.partition_dir(4))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);

        store.remove_partition(9).unwrap();
        assert_eq!(store.partitions().unwrap(), vec![4]);
        assert!(store.delete(4, "a/c/o2").unwrap());
        assert!(!store.delete(4, "a/c/o2").unwrap());
    }

    #[test]
    fn audit_quarantines_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), ConflictPolicy::default()).unwrap();
        store.put(1, record("good", 1, b"payload")).unwrap();
        store.put(1, record("rotten", 1, b"payload")).unwrap();
        store.put(1, record("garbled", 1, b"payload")).unwrap();

        // Bit rot in the payload of one file, garbage in another.
        let rotten = store.object_path(1, "rotten");
        let mut bytes = fs::read(&rotten).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xff;
        fs::write(&rotten, bytes).unwrap();
        fs::write(store.object_path(1, "garbled"), b"\x01").unwrap();

        assert_eq!(store.audit(1).unwrap(), vec!["rotten".to_string()]);
        assert_eq!(store.quarantined(), 1);

        store.quarantine(1, "rotten").unwrap();
        assert_eq!(store.quarantined(), 2);
        let names: Vec<String> = store.list(1).unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["good"]);
    }

    #[test]
    fn reclaims_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), ConflictPolicy::default()).unwrap();
        let deleted = ObjectRecord::tombstone("gone", Version::new(Timestamp::from_secs(100), 0));
        store.put(2, deleted).unwrap();
        store.put(2, record("kept", 100, b"x")).unwrap();

        let purged = store
            .reclaim(2, Duration::from_secs(60), Timestamp::from_secs(1000))
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(2, "gone").unwrap().is_none());
        assert!(store.get(2, "kept").unwrap().is_some());
    }
}
