use {
    serde::{Deserialize, Serialize},
    std::{
        cmp::Ordering,
        fmt,
        time::{Duration, SystemTime, UNIX_EPOCH},
    },
};

/// Point in time an update was made, with microsecond resolution.
///
/// `offset` orders internally generated updates that share the same wall
/// clock instant (for example a metadata update derived from a write).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    micros: u64,
    offset: u32,
}

impl Timestamp {
    pub const fn from_micros(micros: u64) -> Self {
        Self { micros, offset: 0 }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self::from_micros(secs * 1_000_000)
    }

    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::from_micros(since_epoch.as_micros() as u64)
    }

    /// Same instant, bumped by `offset`.
    pub const fn with_offset(self, offset: u32) -> Self {
        Self {
            micros: self.micros,
            offset,
        }
    }

    pub const fn micros(&self) -> u64 {
        self.micros
    }

    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Whether this timestamp lies more than `age` before `now`.
    pub fn older_than(&self, age: Duration, now: Timestamp) -> bool {
        self.micros.saturating_add(age.as_micros() as u64) < now.micros
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.micros / 1_000_000, self.micros % 1_000_000)?;
        if self.offset > 0 {
            write!(f, "_{:016x}", self.offset)?;
        }
        Ok(())
    }
}

/// Version of an object: when it was written and by whom.
///
/// `origin` is the stable identity of the writer and is only consulted when
/// two timestamps are equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub timestamp: Timestamp,
    pub origin: u64,
}

impl Version {
    pub const fn new(timestamp: Timestamp, origin: u64) -> Self {
        Self { timestamp, origin }
    }
}

/// How concurrent updates to the same key are ordered.
///
/// Resolution never depends on arrival order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Newer timestamp wins, equal timestamps are ordered by origin.
    #[default]
    TimestampThenOrigin,
    /// Newer timestamp wins, on equal timestamps a tombstone wins, then origin.
    TimestampThenTombstone,
}

impl ConflictPolicy {
    /// Orders `(version, is_tombstone)` pairs; `Greater` means `a` wins.
    pub fn compare(&self, a: (&Version, bool), b: (&Version, bool)) -> Ordering {
        let by_time = a.0.timestamp.cmp(&b.0.timestamp);
        match self {
            Self::TimestampThenOrigin => by_time.then(a.0.origin.cmp(&b.0.origin)),
            Self::TimestampThenTombstone => by_time
                .then(a.1.cmp(&b.1))
                .then(a.0.origin.cmp(&b.0.origin)),
        }
    }
}
