mod diff;
mod placement;

#[cfg(test)]
mod builder_test;

use {
    crate::{
        RingError,
        RingResult,
        config::BuilderConfig,
        device::{DeviceId, DeviceSpec, DeviceState, DeviceTable, NONE_DEVICE},
        hash::{MAX_PART_POWER, PathHasher},
        ring::{Ring, RingData, write_atomic},
    },
    placement::{Placement, undispersed_percent},
    serde::{Deserialize, Serialize},
    std::{fs, path::Path},
    tracing::{debug, info},
};

pub use {
    diff::{PartitionMove, RingDiff},
    placement::{Dispersion, MAX_BALANCE},
};

/// Outcome of a successful rebalance.
#[derive(Debug, Clone)]
pub struct Rebalance {
    pub ring: Ring,
    pub diff: RingDiff,
    /// See [`RingBuilder::balance`].
    pub balance: f64,
}

/// Computes and incrementally updates partition assignments.
///
/// The builder owns the device table. Topology changes are recorded with the
/// device methods and take effect at the next [`rebalance`](Self::rebalance),
/// which moves as few replicas as possible: only slots held by removed
/// devices, slots breaking zone dispersion and slots above a device's share
/// are reassigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingBuilder {
    part_power: u8,
    replicas: usize,
    one_move_per_rebalance: bool,
    hasher: PathHasher,
    devices: DeviceTable,
    /// `assignments[replica][partition]`, empty before the first rebalance.
    assignments: Vec<Vec<DeviceId>>,
    /// Version of the last ring produced.
    version: u64,
}

impl RingBuilder {
    pub fn new(config: &BuilderConfig) -> RingResult<Self> {
        if config.part_power > MAX_PART_POWER {
            return Err(RingError::InvalidPartPower(config.part_power));
        }
        if config.replicas == 0 {
            return Err(RingError::InvalidReplicaCount(config.replicas));
        }
        Ok(Self {
            part_power: config.part_power,
            replicas: config.replicas,
            one_move_per_rebalance: config.one_replica_move_per_rebalance,
            hasher: PathHasher::new(config.hash_prefix.clone(), config.hash_suffix.clone()),
            devices: DeviceTable::new(),
            assignments: Vec::new(),
            version: 0,
        })
    }

    /// Reconstructs a builder from a deployed ring, so that the next
    /// rebalance starts from what is actually served.
    pub fn from_ring(ring: &Ring, config: &BuilderConfig) -> RingResult<Self> {
        let mut devices = DeviceTable::new();
        for device in ring.devices() {
            devices.restore(device.clone())?;
        }
        devices.rebuild_free_list();

        Ok(Self {
            part_power: ring.part_power(),
            replicas: ring.replica_count(),
            one_move_per_rebalance: config.one_replica_move_per_rebalance,
            hasher: ring.hasher().clone(),
            devices,
            assignments: ring.assignments().to_vec(),
            version: ring.version(),
        })
    }

    pub fn part_power(&self) -> u8 {
        self.part_power
    }

    pub fn partition_count(&self) -> usize {
        1 << self.part_power
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub fn add_device(&mut self, spec: DeviceSpec) -> RingResult<DeviceId> {
        let id = self.devices.add(spec)?;
        debug!(device = id, "device added");
        Ok(id)
    }

    pub fn set_weight(&mut self, id: DeviceId, weight: f64) -> RingResult<()> {
        self.devices.set_weight(id, weight)
    }

    pub fn drain(&mut self, id: DeviceId) -> RingResult<()> {
        self.devices.drain(id)
    }

    pub fn remove_device(&mut self, id: DeviceId) -> RingResult<()> {
        self.devices.remove(id)
    }

    pub fn activate(&mut self, id: DeviceId) -> RingResult<()> {
        self.devices.activate(id)
    }

    /// Changes the replica count.
    ///
    /// New replica rows start empty and are filled at the next rebalance;
    /// shrinking drops the trailing rows.
    pub fn set_replicas(&mut self, replicas: usize) -> RingResult<()> {
        if replicas == 0 {
            return Err(RingError::InvalidReplicaCount(replicas));
        }
        if !self.assignments.is_empty() {
            let partitions = self.partition_count();
            self.assignments.resize_with(replicas, || vec![NONE_DEVICE; partitions]);
        }
        self.replicas = replicas;
        Ok(())
    }

    /// Rebalances with strict zone dispersion.
    pub fn rebalance(&mut self) -> RingResult<Rebalance> {
        self.rebalance_with(Dispersion::Strict)
    }

    /// Rebalances sharing zones where there are fewer zones than replicas.
    pub fn rebalance_degraded(&mut self) -> RingResult<Rebalance> {
        self.rebalance_with(Dispersion::Degraded)
    }

    /// Computes the next assignment table and ring version.
    ///
    /// Fails with [`RingError::InfeasiblePlacement`] when the assignable
    /// devices cannot hold every replica under the requested dispersion; the
    /// builder is left untouched in that case.
    pub fn rebalance_with(&mut self, dispersion: Dispersion) -> RingResult<Rebalance> {
        let infeasible = RingError::InfeasiblePlacement {
            replicas: self.replicas,
            devices: self.devices.assignable().count(),
            zones: self.devices.zone_count(),
        };
        let enough_zones =
            dispersion == Dispersion::Degraded || self.devices.zone_count() >= self.replicas;
        if self.devices.assignable().count() < self.replicas || !enough_zones {
            return Err(infeasible);
        }

        let partitions = self.partition_count();
        let mut table = self.assignments.clone();
        table.resize_with(self.replicas, Vec::new);
        for row in &mut table {
            row.resize(partitions, NONE_DEVICE);
        }

        let mut placement =
            Placement::new(&self.devices, table, dispersion, self.one_move_per_rebalance);
        let mut gathered = placement.gather_unplaced();
        gathered.extend(placement.gather_undispersed());
        gathered.extend(placement.gather_overweight());
        gathered.sort_unstable();

        for slot in gathered {
            if placement.place(slot).is_none() {
                return Err(infeasible);
            }
        }

        let balance = placement.balance();
        let emptied: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|d| d.state == DeviceState::Removed && placement.assigned(d.id) == 0)
            .map(|d| d.id)
            .collect();
        let table = placement.into_table();

        let version = self.version + 1;
        let diff = RingDiff::between(&self.assignments, &table, self.version, version);
        for id in emptied {
            if let Some(device) = self.devices.purge(id) {
                debug!(device = %device, "removed device purged");
            }
        }
        self.assignments = table;
        self.version = version;
        let ring = self.ring()?;

        info!(
            version,
            moved = diff.moved_replicas(),
            partitions = diff.moved_partitions(),
            balance,
            "rebalanced"
        );
        Ok(Rebalance { ring, diff, balance })
    }

    /// Ring for the current assignments.
    pub fn ring(&self) -> RingResult<Ring> {
        if self.assignments.is_empty() {
            return Err(RingError::CorruptRing("builder was never rebalanced".to_string()));
        }
        Ring::from_data(RingData {
            version: self.version,
            part_power: self.part_power,
            replica_count: self.replicas,
            hasher: self.hasher.clone(),
            devices: self.devices.iter().cloned().collect(),
            assignments: self.assignments.clone(),
        })
    }

    /// Largest percentage by which any device's share of slots deviates from
    /// its weight-derived target. [`MAX_BALANCE`] when a device that must not
    /// hold slots still does.
    pub fn balance(&self) -> f64 {
        if self.assignments.is_empty() {
            return 0.0;
        }
        let dispersion = if self.devices.zone_count() >= self.replicas {
            Dispersion::Strict
        } else {
            Dispersion::Degraded
        };
        Placement::new(&self.devices, self.assignments.clone(), dispersion, false).balance()
    }

    /// Percentage of partitions with two or more replicas in one zone.
    pub fn dispersion(&self) -> f64 {
        undispersed_percent(&self.devices, &self.assignments)
    }

    /// Slots held by the device.
    pub fn assigned(&self, id: DeviceId) -> usize {
        self.assignments.iter().flatten().filter(|d| **d == id).count()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> RingResult<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path.as_ref(), &bytes)
    }

    pub fn load(path: impl AsRef<Path>) -> RingResult<Self> {
        let bytes = fs::read(path.as_ref())?;
        let builder: Self = serde_json::from_slice(&bytes)?;
        if builder.part_power > MAX_PART_POWER {
            return Err(RingError::InvalidPartPower(builder.part_power));
        }
        if builder.replicas == 0 {
            return Err(RingError::InvalidReplicaCount(builder.replicas));
        }
        Ok(builder)
    }
}
