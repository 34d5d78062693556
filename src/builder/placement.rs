use {
    crate::{
        device::{Device, DeviceId, DeviceState, DeviceTable, NONE_DEVICE},
        hash::{Partition, pair_score},
    },
    std::{
        cmp::{Ordering, Reverse},
        collections::{BTreeMap, HashSet},
    },
};

/// Balance reported when a device that must not hold partitions still does.
pub const MAX_BALANCE: f64 = 999.99;

/// Replica slot, `(partition, replica)`.
pub(crate) type Slot = (usize, usize);

/// How strictly replicas of a partition are spread over zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispersion {
    /// No two replicas of a partition share a zone. Requires at least as many
    /// zones as replicas.
    Strict,
    /// Replicas are spread over as many zones as exist, sharing where they
    /// must. Only requires as many devices as replicas.
    Degraded,
}

/// Working state of one rebalance.
///
/// Slots are first gathered (unassigned) for one of three reasons: their
/// device is gone, they break zone dispersion, or their device holds more
/// than its share. Gathered slots are then placed one by one on the best
/// candidate device.
pub(crate) struct Placement<'a> {
    devices: &'a DeviceTable,
    table: Vec<Vec<DeviceId>>,
    /// Slots held, indexed by device id.
    assigned: Vec<usize>,
    /// Weight-derived share of slots, indexed by device id.
    target: Vec<f64>,
    /// Partitions that already had a replica moved in this rebalance.
    moved: Vec<bool>,
    dispersion: Dispersion,
    one_move: bool,
}

impl<'a> Placement<'a> {
    pub fn new(
        devices: &'a DeviceTable,
        table: Vec<Vec<DeviceId>>,
        dispersion: Dispersion,
        one_move: bool,
    ) -> Self {
        let bound = devices.id_bound();
        let partitions = table.first().map_or(0, Vec::len);

        let mut assigned = vec![0; bound];
        for id in table.iter().flatten() {
            if let Some(count) = assigned.get_mut(usize::from(*id)) {
                *count += 1;
            }
        }
        let target = targets(devices, partitions, table.len(), dispersion);

        Self {
            devices,
            table,
            assigned,
            target,
            moved: vec![false; partitions],
            dispersion,
            one_move,
        }
    }

    fn partitions(&self) -> usize {
        self.moved.len()
    }

    fn replicas(&self) -> usize {
        self.table.len()
    }

    fn unassign(&mut self, (part, replica): Slot) {
        let id = std::mem::replace(&mut self.table[replica][part], NONE_DEVICE);
        if let Some(count) = self.assigned.get_mut(usize::from(id)) {
            *count = count.saturating_sub(1);
        }
        self.moved[part] = true;
    }

    /// Gathers slots that are empty or held by removed or unknown devices.
    pub fn gather_unplaced(&mut self) -> Vec<Slot> {
        let mut gathered = Vec::new();
        for replica in 0..self.replicas() {
            for part in 0..self.partitions() {
                let id = self.table[replica][part];
                let gone = id == NONE_DEVICE
                    || self
                        .devices
                        .get(id)
                        .is_none_or(|d| d.state == DeviceState::Removed);
                if gone {
                    self.unassign((part, replica));
                    gathered.push((part, replica));
                }
            }
        }
        gathered
    }

    /// Gathers replicas sharing a zone with an earlier replica of the same
    /// partition, if enough zones exist to separate them.
    pub fn gather_undispersed(&mut self) -> Vec<Slot> {
        let mut gathered = Vec::new();
        if self.devices.zone_count() < self.replicas() {
            return gathered;
        }
        let mut seen = HashSet::with_capacity(self.replicas());
        for part in 0..self.partitions() {
            seen.clear();
            for replica in 0..self.replicas() {
                let Some(device) = self.devices.get(self.table[replica][part]) else {
                    continue;
                };
                if !seen.insert(device.tier()) {
                    self.unassign((part, replica));
                    gathered.push((part, replica));
                }
            }
        }
        gathered
    }

    /// Gathers slots from devices holding more than their share, until they
    /// are back within it.
    ///
    /// When `one_move` is set, a partition that already had a replica moved
    /// in this rebalance is left alone.
    pub fn gather_overweight(&mut self) -> Vec<Slot> {
        let mut gathered = Vec::new();
        let devices = self.devices;
        for device in devices.iter() {
            let id = usize::from(device.id);
            let allowed = if device.is_assignable() {
                self.target[id].ceil() as usize
            } else {
                0
            };
            if self.assigned[id] <= allowed {
                continue;
            }

            let mut held: Vec<Slot> = Vec::new();
            for (replica, row) in self.table.iter().enumerate() {
                for (part, holder) in row.iter().enumerate() {
                    if *holder == device.id {
                        held.push((part, replica));
                    }
                }
            }
            held.sort_by_key(|(part, _)| Reverse(pair_score(*part as Partition, device.id)));

            for slot in held {
                if self.assigned[id] <= allowed {
                    break;
                }
                if self.one_move && self.moved[slot.0] {
                    continue;
                }
                self.unassign(slot);
                gathered.push(slot);
            }
        }
        gathered
    }

    /// Assigns the slot to the best candidate device.
    ///
    /// Candidates are ranked by how many of the partition's other replicas
    /// share their region, then their zone (fewer first), then by how far
    /// they are below their share, then by how few slots they hold. Remaining
    /// ties are broken by a stable per-(partition, device) hash.
    pub fn place(&mut self, (part, replica): Slot) -> Option<DeviceId> {
        let devices = self.devices;
        let others: Vec<&Device> = (0..self.replicas())
            .filter(|r| *r != replica)
            .filter_map(|r| devices.get(self.table[r][part]))
            .collect();

        let chosen = devices
            .assignable()
            .filter(|d| others.iter().all(|o| o.id != d.id))
            .filter(|d| {
                self.dispersion == Dispersion::Degraded
                    || others.iter().all(|o| o.tier() != d.tier())
            })
            .min_by(|a, b| self.rank(part, a, b, &others))?
            .id;

        self.table[replica][part] = chosen;
        self.assigned[usize::from(chosen)] += 1;
        Some(chosen)
    }

    fn rank(&self, part: usize, a: &Device, b: &Device, others: &[&Device]) -> Ordering {
        let region_use = |d: &Device| others.iter().filter(|o| o.region == d.region).count();
        let zone_use = |d: &Device| others.iter().filter(|o| o.tier() == d.tier()).count();
        let wanted = |d: &Device| {
            let id = usize::from(d.id);
            self.target[id] - self.assigned[id] as f64
        };

        region_use(a)
            .cmp(&region_use(b))
            .then_with(|| zone_use(a).cmp(&zone_use(b)))
            .then_with(|| wanted(b).total_cmp(&wanted(a)))
            .then_with(|| self.assigned[usize::from(a.id)].cmp(&self.assigned[usize::from(b.id)]))
            .then_with(|| {
                pair_score(part as Partition, b.id).cmp(&pair_score(part as Partition, a.id))
            })
    }

    /// Largest deviation, in percent, of any device from its share.
    pub fn balance(&self) -> f64 {
        let mut worst: f64 = 0.0;
        for device in self.devices.iter() {
            let id = usize::from(device.id);
            let held = self.assigned[id] as f64;
            let target = self.target[id];
            if target <= 0.0 {
                if held > 0.0 {
                    return MAX_BALANCE;
                }
                continue;
            }
            worst = worst.max((held - target).abs() / target * 100.0);
        }
        worst
    }

    pub fn into_table(self) -> Vec<Vec<DeviceId>> {
        self.table
    }

    /// Slots held by the device after placement.
    pub fn assigned(&self, id: DeviceId) -> usize {
        self.assigned.get(usize::from(id)).copied().unwrap_or(0)
    }
}

/// Percentage of partitions with two or more replicas in the same zone.
pub(crate) fn undispersed_percent(devices: &DeviceTable, table: &[Vec<DeviceId>]) -> f64 {
    let partitions = table.first().map_or(0, Vec::len);
    if partitions == 0 {
        return 0.0;
    }
    let mut seen = HashSet::new();
    let undispersed = (0..partitions)
        .filter(|part| {
            seen.clear();
            table
                .iter()
                .filter_map(|row| devices.get(row[*part]))
                .any(|d| !seen.insert(d.tier()))
        })
        .count();
    undispersed as f64 / partitions as f64 * 100.0
}

/// Share of slots each assignable device should hold, indexed by device id.
///
/// No device may hold more than one replica of a partition, and under strict
/// dispersion no zone may either, so shares are capped at `partitions` and
/// the excess is spread over the others in proportion to their weight.
fn targets(
    devices: &DeviceTable,
    partitions: usize,
    replicas: usize,
    dispersion: Dispersion,
) -> Vec<f64> {
    let mut target = vec![0.0; devices.id_bound()];
    let slots = (partitions * replicas) as f64;
    let cap = partitions as f64;

    match dispersion {
        Dispersion::Strict => {
            let mut zones: BTreeMap<(u32, u32), Vec<&Device>> = BTreeMap::new();
            for device in devices.assignable() {
                zones.entry(device.tier()).or_default().push(device);
            }
            let zone_weights: Vec<f64> = zones
                .values()
                .map(|members| members.iter().map(|d| d.weight).sum())
                .collect();
            let zone_targets = water_fill(&zone_weights, slots, cap);
            for ((members, zone_weight), zone_target) in
                zones.values().zip(&zone_weights).zip(zone_targets)
            {
                for device in members {
                    target[usize::from(device.id)] = zone_target * device.weight / zone_weight;
                }
            }
        }
        Dispersion::Degraded => {
            let members: Vec<&Device> = devices.assignable().collect();
            let weights: Vec<f64> = members.iter().map(|d| d.weight).collect();
            for (device, share) in members.iter().zip(water_fill(&weights, slots, cap)) {
                target[usize::from(device.id)] = share;
            }
        }
    }
    target
}

/// Splits `total` in proportion to `weights`, capping every share at `cap`
/// and redistributing what the capped shares give up.
fn water_fill(weights: &[f64], total: f64, cap: f64) -> Vec<f64> {
    let mut shares = vec![0.0; weights.len()];
    let mut capped = vec![false; weights.len()];
    loop {
        let capped_count = capped.iter().filter(|c| **c).count();
        let remaining = total - capped_count as f64 * cap;
        let free_weight: f64 = weights
            .iter()
            .zip(&capped)
            .filter(|(_, c)| !**c)
            .map(|(w, _)| *w)
            .sum();
        if free_weight <= 0.0 {
            return shares;
        }

        let mut changed = false;
        for (i, weight) in weights.iter().enumerate() {
            if capped[i] {
                continue;
            }
            shares[i] = remaining * weight / free_weight;
            if shares[i] > cap {
                shares[i] = cap;
                capped[i] = true;
                changed = true;
            }
        }
        if !changed {
            return shares;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn water_fill_caps_and_redistributes() {
        let shares = water_fill(&[1.0, 1.0, 1.0, 1.0], 12.0, 10.0);
        assert_eq!(shares, vec![3.0, 3.0, 3.0, 3.0]);

        // The heavy entry would get 30 but is capped at 10, the rest share 20.
        let shares = water_fill(&[6.0, 1.0, 1.0, 2.0], 40.0, 10.0);
        assert_eq!(shares[0], 10.0);
        assert!(shares[1..].iter().all(|s| *s <= 10.0));
        assert!((shares.iter().sum::<f64>() - 40.0).abs() < 1e-9);

        assert_eq!(water_fill(&[0.0, 0.0], 5.0, 10.0), vec![0.0, 0.0]);
    }
}
