pub mod handle;


use {
    crate::{
        RingError,
        RingResult,
        device::{Device, DeviceId, NONE_DEVICE},
        hash::{MAX_PART_POWER, Partition, PathHasher, pair_score},
    },
    serde::{Deserialize, Serialize},
    std::{
        cmp::Reverse,
        collections::HashSet,
        fs,
        io::Write,
        path::Path,
    },
    tracing::debug,
};

pub use handle::RingHandle;

/// Serialized form of a ring.
///
/// `assignments[replica][partition]` is the id of the device holding that
/// replica of the partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingData {
    pub version: u64,
    pub part_power: u8,
    pub replica_count: usize,
    #[serde(default)]
    pub hasher: PathHasher,
    pub devices: Vec<Device>,
    pub assignments: Vec<Vec<DeviceId>>,
}

/// Immutable, versioned mapping from partitions to ordered replica devices.
///
/// A ring is never modified once built: a new version is produced by the
/// builder and swapped in through a [`RingHandle`].
#[derive(Debug, Clone)]
pub struct Ring {
    version: u64,
    part_power: u8,
    replica_count: usize,
    hasher: PathHasher,
    /// Devices indexed by id.
    devices: Vec<Option<Device>>,
    assignments: Vec<Vec<DeviceId>>,
}

impl Ring {
    /// Validates and wraps ring data.
    ///
    /// Every partition must be covered exactly `replica_count` times by
    /// distinct, known devices, otherwise the ring is corrupt.
    pub fn from_data(data: RingData) -> RingResult<Self> {
        let corrupt = |msg: String| Err(RingError::CorruptRing(msg));

        if data.part_power > MAX_PART_POWER {
            return corrupt(format!("partition power {} too large", data.part_power));
        }
        if data.replica_count == 0 {
            return corrupt("zero replicas".to_string());
        }
        if data.assignments.len() != data.replica_count {
            return corrupt(format!(
                "{} replica rows for replica count {}",
                data.assignments.len(),
                data.replica_count
            ));
        }

        let mut devices: Vec<Option<Device>> = Vec::new();
        for device in data.devices {
            if device.id == NONE_DEVICE {
                return corrupt("reserved device id in device list".to_string());
            }
            let idx = usize::from(device.id);
            if devices.len() <= idx {
                devices.resize(idx + 1, None);
            }
            if devices[idx].is_some() {
                return corrupt(format!("device {} listed twice", device.id));
            }
            devices[idx] = Some(device);
        }

        let partitions = 1usize << data.part_power;
        for (replica, row) in data.assignments.iter().enumerate() {
            if row.len() != partitions {
                return corrupt(format!(
                    "replica {replica} covers {} of {partitions} partitions",
                    row.len()
                ));
            }
            if let Some(id) = row
                .iter()
                .find(|id| devices.get(usize::from(**id)).is_none_or(Option::is_none))
            {
                return corrupt(format!("replica {replica} references unknown device {id}"));
            }
        }

        let mut seen = HashSet::with_capacity(data.replica_count);
        for part in 0..partitions {
            seen.clear();
            for row in &data.assignments {
                if !seen.insert(row[part]) {
                    return corrupt(format!("partition {part} assigned to device {} twice", row[part]));
                }
            }
        }

        Ok(Self {
            version: data.version,
            part_power: data.part_power,
            replica_count: data.replica_count,
            hasher: data.hasher,
            devices,
            assignments: data.assignments,
        })
    }

    /// Serializable copy of the ring.
    pub fn to_data(&self) -> RingData {
        RingData {
            version: self.version,
            part_power: self.part_power,
            replica_count: self.replica_count,
            hasher: self.hasher.clone(),
            devices: self.devices().cloned().collect(),
            assignments: self.assignments.clone(),
        }
    }

    /// Loads and validates a ring file.
    pub fn load(path: impl AsRef<Path>) -> RingResult<Self> {
        let bytes = fs::read(path.as_ref())?;
        let data: RingData = serde_json::from_slice(&bytes)
            .map_err(|e| RingError::CorruptRing(format!("undecodable ring file: {e}")))?;
        let ring = Self::from_data(data)?;
        debug!(version = ring.version, path = %path.as_ref().display(), "ring loaded");
        Ok(ring)
    }

    /// Writes the ring file atomically: readers see either the previous file
    /// or the complete new one.
    pub fn save(&self, path: impl AsRef<Path>) -> RingResult<()> {
        let bytes = serde_json::to_vec(&self.to_data())?;
        write_atomic(path.as_ref(), &bytes)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn part_power(&self) -> u8 {
        self.part_power
    }

    pub fn partition_count(&self) -> usize {
        1 << self.part_power
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn hasher(&self) -> &PathHasher {
        &self.hasher
    }

    /// Partition a key belongs to.
    pub fn partition_for(&self, key: impl AsRef<[u8]>) -> Partition {
        self.hasher.partition(key.as_ref(), self.part_power)
    }

    /// Replica devices of a key, primary first.
    pub fn devices_for(&self, key: impl AsRef<[u8]>) -> Vec<&Device> {
        self.primary_devices(self.partition_for(key))
    }

    /// Replica device ids of a partition, in replica order. Empty for a
    /// partition outside the ring.
    pub fn primary_ids(&self, partition: Partition) -> Vec<DeviceId> {
        let part = partition as usize;
        self.assignments
            .iter()
            .filter_map(|row| row.get(part).copied())
            .collect()
    }

    /// Replica devices of a partition, in replica order.
    pub fn primary_devices(&self, partition: Partition) -> Vec<&Device> {
        self.primary_ids(partition)
            .into_iter()
            .filter_map(|id| self.device(id))
            .collect()
    }

    /// Ordered fallback devices for a partition.
    ///
    /// Devices in regions the primaries do not use come first, then devices in
    /// unused zones, then everything else. Within a group, order is fixed by a
    /// per-(partition, device) hash, so every node walks the same list.
    pub fn handoff_devices(&self, partition: Partition) -> Vec<&Device> {
        if partition as usize >= self.partition_count() {
            return Vec::new();
        }
        let primaries = self.primary_ids(partition);
        let primary_devs: Vec<&Device> = primaries.iter().filter_map(|id| self.device(*id)).collect();
        let used_regions: HashSet<u32> = primary_devs.iter().map(|d| d.region).collect();
        let used_zones: HashSet<(u32, u32)> = primary_devs.iter().map(|d| d.tier()).collect();

        let mut handoffs: Vec<&Device> = self
            .devices()
            .filter(|d| d.is_assignable() && !primaries.contains(&d.id))
            .collect();
        handoffs.sort_by_key(|d| {
            (
                used_regions.contains(&d.region),
                used_zones.contains(&d.tier()),
                Reverse(pair_score(partition, d.id)),
            )
        });
        handoffs
    }

    /// Replica index at which the device holds the partition, if any.
    pub fn replica_index(&self, partition: Partition, id: DeviceId) -> Option<usize> {
        let part = partition as usize;
        self.assignments
            .iter()
            .position(|row| row.get(part) == Some(&id))
    }

    pub fn is_primary(&self, partition: Partition, id: DeviceId) -> bool {
        self.replica_index(partition, id).is_some()
    }

    /// Partitions for which the device holds a replica, ascending.
    pub fn partitions_for_device(&self, id: DeviceId) -> Vec<Partition> {
        (0..self.partition_count())
            .filter(|part| self.assignments.iter().any(|row| row[*part] == id))
            .map(|part| part as Partition)
            .collect()
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(usize::from(id)).and_then(Option::as_ref)
    }

    /// All devices known to the ring, ordered by id.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().flatten()
    }

    pub(crate) fn assignments(&self) -> &[Vec<DeviceId>] {
        &self.assignments
    }
}

/// Writes `bytes` to a temporary sibling of `path`, then renames it over
/// `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> RingResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
