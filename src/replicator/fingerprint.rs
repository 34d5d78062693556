use {
    crate::{hash::digest, store::ObjectMeta},
    serde::{Deserialize, Serialize},
};

/// Bucket of an object name among `buckets` buckets.
pub fn bucket_of(name: &str, buckets: u16) -> u16 {
    (digest(name.as_bytes()) % u64::from(buckets.max(1))) as u16
}

/// Summary of a partition's contents, one hash per name bucket.
///
/// Two replicas holding the same names at the same versions have equal
/// fingerprints; comparing bucket by bucket narrows a divergence down to
/// the names that need to be exchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    buckets: Vec<u64>,
}

impl Fingerprint {
    pub fn of<'a>(metas: impl IntoIterator<Item = &'a ObjectMeta>, buckets: u16) -> Self {
        let mut sums = vec![0u64; usize::from(buckets.max(1))];
        for meta in metas {
            let bucket = usize::from(bucket_of(&meta.name, buckets));
            sums[bucket] = sums[bucket].wrapping_add(entry_hash(meta));
        }
        Self { buckets: sums }
    }

    pub fn bucket_count(&self) -> u16 {
        self.buckets.len() as u16
    }

    /// Combined hash of every bucket.
    pub fn root(&self) -> u64 {
        let bytes: Vec<u8> = self.buckets.iter().flat_map(|b| b.to_le_bytes()).collect();
        digest(&bytes)
    }

    /// Buckets whose contents differ; every bucket when the shapes differ.
    pub fn diff(&self, other: &Fingerprint) -> Vec<u16> {
        if self.buckets.len() != other.buckets.len() {
            return (0..self.bucket_count().max(other.bucket_count())).collect();
        }
        self.buckets
            .iter()
            .zip(&other.buckets)
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i as u16)
            .collect()
    }
}

fn entry_hash(meta: &ObjectMeta) -> u64 {
    let mut buf = Vec::with_capacity(meta.name.len() + 21);
    buf.extend_from_slice(meta.name.as_bytes());
    buf.extend_from_slice(&meta.version.timestamp.micros().to_le_bytes());
    buf.extend_from_slice(&meta.version.timestamp.offset().to_le_bytes());
    buf.extend_from_slice(&meta.version.origin.to_le_bytes());
    buf.push(u8::from(meta.tombstone));
    digest(&buf)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::timestamp::{Timestamp, Version},
    };

    fn meta(name: &str, secs: u64) -> ObjectMeta {
        ObjectMeta {
            name: name.to_string(),
            version: Version::new(Timestamp::from_secs(secs), 0),
            tombstone: false,
        }
    }

    #[test]
    fn fingerprints() {
        let local: Vec<ObjectMeta> = (0..100).map(|i| meta(&format!("o{i}"), 10)).collect();
        let mut remote = local.clone();
        remote.reverse();

        // Order independent.
        let a = Fingerprint::of(&local, 16);
        assert_eq!(a, Fingerprint::of(&remote, 16));
        assert_eq!(a.root(), Fingerprint::of(&remote, 16).root());
        assert!(a.diff(&Fingerprint::of(&remote, 16)).is_empty());

        // A newer version of one object shows up in exactly its bucket.
        remote[0] = meta(&remote[0].name, 11);
        let b = Fingerprint::of(&remote, 16);
        assert_ne!(a.root(), b.root());
        assert_eq!(a.diff(&b), vec![bucket_of(&remote[0].name, 16)]);

        // A tombstone differs from a live object at the same version.
        let mut deleted = meta("o1", 10);
        deleted.tombstone = true;
        assert_ne!(entry_hash(&deleted), entry_hash(&meta("o1", 10)));

        assert_eq!(a.diff(&Fingerprint::of(&local, 8)).len(), 16);
        assert_eq!(Fingerprint::of(&[], 0).bucket_count(), 1);
    }
}
