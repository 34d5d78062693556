use {
    crate::{RingError, RingResult},
    serde::{Deserialize, Serialize},
    std::{
        collections::{BTreeMap, BTreeSet, VecDeque},
        fmt,
        ops::Index,
    },
};

#[cfg(test)]
mod device_test;

/// Device handle.
///
/// Wherever a device needs to be stored (most notably in the partition
/// assignment table), only its id is kept, which takes up two bytes.
pub type DeviceId = u16;

/// Reserved id marking an unassigned replica slot.
pub(crate) const NONE_DEVICE: DeviceId = DeviceId::MAX;

/// Lifecycle of a device in the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Receives partitions in proportion to its weight.
    #[default]
    Active,
    /// Keeps what it has, receives nothing new and is emptied gradually.
    Draining,
    /// Emptied at the next rebalance, then purged from the table.
    Removed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Storage device that holds partition replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// Network location of the serving node, `host:port`.
    pub address: String,
    /// Mount point or drive name on that node.
    pub drive: String,
    /// Capacity proportion relative to the other devices.
    pub weight: f64,
    pub zone: u32,
    pub region: u32,
    #[serde(default)]
    pub state: DeviceState,
}

impl Device {
    /// Whether the device may be given new partitions.
    pub fn is_assignable(&self) -> bool {
        self.state == DeviceState::Active && self.weight > 0.0
    }

    /// Failure domain of the device, `(region, zone)`.
    pub fn tier(&self) -> (u32, u32) {
        (self.region, self.zone)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "d{}r{}z{}-{}/{}",
            self.id, self.region, self.zone, self.address, self.drive
        )
    }
}

/// Description of a device to be added; the table assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub address: String,
    pub drive: String,
    pub weight: f64,
    pub zone: u32,
    pub region: u32,
}

impl DeviceSpec {
    pub fn new(address: impl Into<String>, drive: impl Into<String>, weight: f64) -> Self {
        Self {
            address: address.into(),
            drive: drive.into(),
            weight,
            zone: 0,
            region: 0,
        }
    }

    pub fn zone(mut self, zone: u32) -> Self {
        self.zone = zone;
        self
    }

    pub fn region(mut self, region: u32) -> Self {
        self.region = region;
        self
    }
}

/// Authoritative list of devices.
///
/// The table hands out ids, reusing the ids of purged devices. Every mutation
/// bumps the table version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceTable {
    devices: BTreeMap<DeviceId, Device>,

    /// Next id that will be assigned, unless the free list has one.
    next_id: DeviceId,

    /// Ids of purged devices, reused first.
    free_list: VecDeque<DeviceId>,

    version: u64,
}

impl Index<DeviceId> for DeviceTable {
    type Output = Device;

    fn index(&self, id: DeviceId) -> &Self::Output {
        &self.devices[&id]
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device and returns its id.
    pub fn add(&mut self, spec: DeviceSpec) -> RingResult<DeviceId> {
        if spec.weight < 0.0 || !spec.weight.is_finite() {
            return Err(RingError::Config(format!("invalid weight {}", spec.weight)));
        }
        let duplicate = self.devices.values().any(|d| {
            d.state != DeviceState::Removed && d.address == spec.address && d.drive == spec.drive
        });
        if duplicate {
            return Err(RingError::DuplicateDevice(format!(
                "{}/{}",
                spec.address, spec.drive
            )));
        }

        let id = match self.free_list.pop_front() {
            Some(id) => id,
            None => {
                if self.next_id >= NONE_DEVICE {
                    return Err(RingError::OutOfDeviceIds);
                }
                self.next_id += 1;
                self.next_id - 1
            }
        };

        self.devices.insert(
            id,
            Device {
                id,
                address: spec.address,
                drive: spec.drive,
                weight: spec.weight,
                zone: spec.zone,
                region: spec.region,
                state: DeviceState::Active,
            },
        );
        self.version += 1;
        Ok(id)
    }

    /// Re-inserts a device under its existing id (used when reconstructing a
    /// table from a deployed ring).
    pub(crate) fn restore(&mut self, device: Device) -> RingResult<()> {
        if device.id >= NONE_DEVICE {
            return Err(RingError::OutOfDeviceIds);
        }
        if self.devices.contains_key(&device.id) {
            return Err(RingError::DuplicateDevice(format!("id {}", device.id)));
        }
        self.next_id = self.next_id.max(device.id + 1);
        self.free_list.retain(|id| *id != device.id);
        self.devices.insert(device.id, device);
        self.version += 1;
        Ok(())
    }

    /// Recomputes the free list as every id below `next_id` that is not in use.
    pub(crate) fn rebuild_free_list(&mut self) {
        self.free_list = (0..self.next_id)
            .filter(|id| !self.devices.contains_key(id))
            .collect();
    }

    pub fn set_weight(&mut self, id: DeviceId, weight: f64) -> RingResult<()> {
        if weight < 0.0 || !weight.is_finite() {
            return Err(RingError::Config(format!("invalid weight {weight}")));
        }
        let device = self.get_mut(id)?;
        device.weight = weight;
        self.version += 1;
        Ok(())
    }

    /// Stops new assignments to the device; its partitions move away over the
    /// following rebalances.
    pub fn drain(&mut self, id: DeviceId) -> RingResult<()> {
        self.set_state(id, DeviceState::Draining)
    }

    /// Marks the device for removal; all its partitions move at the next
    /// rebalance.
    pub fn remove(&mut self, id: DeviceId) -> RingResult<()> {
        self.set_state(id, DeviceState::Removed)
    }

    /// Puts a draining device back into service.
    pub fn activate(&mut self, id: DeviceId) -> RingResult<()> {
        self.set_state(id, DeviceState::Active)
    }

    fn set_state(&mut self, id: DeviceId, state: DeviceState) -> RingResult<()> {
        let device = self.get_mut(id)?;
        if device.state == DeviceState::Removed && state != DeviceState::Removed {
            return Err(RingError::UnknownDevice(id));
        }
        device.state = state;
        self.version += 1;
        Ok(())
    }

    /// Physically deletes a removed device, releasing its id.
    ///
    /// Callers must make sure no assignment references the device anymore.
    pub(crate) fn purge(&mut self, id: DeviceId) -> Option<Device> {
        match self.devices.get(&id) {
            Some(device) if device.state == DeviceState::Removed => {}
            _ => return None,
        }
        let device = self.devices.remove(&id);
        self.free_list.push_back(id);
        self.version += 1;
        device
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    fn get_mut(&mut self, id: DeviceId) -> RingResult<&mut Device> {
        self.devices.get_mut(&id).ok_or(RingError::UnknownDevice(id))
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id)
    }

    /// All devices, ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Devices that may receive new partitions.
    pub fn assignable(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(|d| d.is_assignable())
    }

    /// Number of distinct zones among assignable devices.
    pub fn zone_count(&self) -> usize {
        self.assignable()
            .map(Device::tier)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Number of distinct regions among assignable devices.
    pub fn region_count(&self) -> usize {
        self.assignable()
            .map(|d| d.region)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Sum of the weights of assignable devices.
    pub fn total_weight(&self) -> f64 {
        self.assignable().map(|d| d.weight).sum()
    }

    /// Id bound: every id in use is below this value.
    pub fn id_bound(&self) -> usize {
        usize::from(self.next_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Mutation counter of the table.
    pub fn version(&self) -> u64 {
        self.version
    }
}
