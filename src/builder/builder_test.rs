use {
    super::*,
    crate::hash::Partition,
    std::collections::{BTreeMap, HashSet},
};

fn config(part_power: u8, replicas: usize) -> BuilderConfig {
    BuilderConfig {
        part_power,
        replicas,
        ..BuilderConfig::default()
    }
}

/// Builder with `per_zone` devices of weight 100 in each of `zones` zones.
fn builder(part_power: u8, replicas: usize, zones: u32, per_zone: u32) -> RingBuilder {
    let mut builder = RingBuilder::new(&config(part_power, replicas)).unwrap();
    for zone in 0..zones {
        for n in 0..per_zone {
            let spec = DeviceSpec::new(format!("10.0.{zone}.{n}:6200"), "sdb", 100.0).zone(zone);
            builder.add_device(spec).unwrap();
        }
    }
    builder
}

fn zones_of(ring: &Ring, part: Partition) -> HashSet<(u32, u32)> {
    ring.primary_devices(part).iter().map(|d| d.tier()).collect()
}

#[test]
fn invalid_configs() {
    assert!(matches!(
        RingBuilder::new(&config(MAX_PART_POWER + 1, 3)),
        Err(RingError::InvalidPartPower(_))
    ));
    assert!(matches!(
        RingBuilder::new(&config(8, 0)),
        Err(RingError::InvalidReplicaCount(0))
    ));

    let mut builder = builder(4, 3, 3, 1);
    assert!(matches!(builder.set_replicas(0), Err(RingError::InvalidReplicaCount(0))));
    assert!(builder.ring().is_err(), "no ring before the first rebalance");
}

#[test]
fn initial_build() {
    let mut builder = builder(8, 3, 3, 2);
    let Rebalance { ring, diff, balance } = builder.rebalance().unwrap();

    assert_eq!(ring.version(), 1);
    assert_eq!(ring.partition_count(), 256);
    assert_eq!(diff.moved_replicas(), 3 * 256);
    assert!(diff.moves().iter().all(|m| m.from.is_none()));
    assert!(balance < 5.0, "balance {balance}");
    assert_eq!(builder.dispersion(), 0.0);

    for part in 0..256 {
        assert_eq!(zones_of(&ring, part).len(), 3);
    }
    for device in builder.devices().iter() {
        assert_eq!(builder.assigned(device.id), 128);
    }

    // Nothing changed: nothing moves, but a new version is cut.
    let again = builder.rebalance().unwrap();
    assert!(again.diff.is_empty());
    assert_eq!(again.ring.version(), 2);
    assert_eq!(again.diff.from_version, 1);
}

#[test]
fn infeasible_placement_leaves_state_unchanged() {
    let mut builder = builder(6, 3, 2, 2);
    let err = builder.rebalance().unwrap_err();
    assert!(matches!(
        err,
        RingError::InfeasiblePlacement { replicas: 3, devices: 4, zones: 2 }
    ));
    assert_eq!(builder.version(), 0);
    assert!(builder.ring().is_err());

    // The caller may accept a degraded placement instead.
    let Rebalance { ring, .. } = builder.rebalance_degraded().unwrap();
    for part in 0..64 {
        assert_eq!(zones_of(&ring, part).len(), 2);
        assert_eq!(ring.primary_ids(part).iter().collect::<HashSet<_>>().len(), 3);
    }
    assert!(builder.dispersion() > 0.0);

    let mut tiny = self::builder(6, 3, 2, 1);
    assert!(matches!(
        tiny.rebalance_degraded(),
        Err(RingError::InfeasiblePlacement { devices: 2, .. })
    ));
}

#[test]
fn device_removal_moves_only_its_share() {
    let mut builder = builder(8, 3, 4, 1);
    let before = builder.rebalance().unwrap().ring;
    let held = builder.assigned(2);
    assert!(held > 0);

    builder.remove_device(2).unwrap();
    let Rebalance { ring, diff, .. } = builder.rebalance().unwrap();

    assert_eq!(diff.moved_replicas(), held);
    assert!(diff.moves().iter().all(|m| m.from == Some(2)));
    for part in 0..256 {
        assert!(!ring.is_primary(part, 2));
        let kept: Vec<DeviceId> = before
            .primary_ids(part)
            .into_iter()
            .filter(|id| *id != 2)
            .collect();
        assert!(kept.iter().all(|id| ring.is_primary(part, *id)));
        assert_eq!(zones_of(&ring, part).len(), 3);
    }

    // Emptied devices are purged and their id is reused.
    assert!(!builder.devices().contains(2));
    assert!(ring.device(2).is_none());
    let id = builder
        .add_device(DeviceSpec::new("10.0.9.9:6200", "sdb", 100.0).zone(9))
        .unwrap();
    assert_eq!(id, 2);
}

#[test]
fn weight_change_moves_proportionally() {
    let mut builder = builder(10, 3, 4, 2);
    builder.rebalance().unwrap();
    builder.rebalance().unwrap();

    let parts = builder.partition_count() as f64;
    let held = builder.assigned(0);
    builder.set_weight(0, 150.0).unwrap();
    let total = builder.devices().total_weight();
    let Rebalance { diff, .. } = builder.rebalance().unwrap();

    let bound = 2.0 * 3.0 * parts * 50.0 / total;
    assert!(diff.moved_replicas() > 0);
    assert!(
        (diff.moved_replicas() as f64) <= bound,
        "moved {} replicas, bound {bound}",
        diff.moved_replicas()
    );
    assert!(builder.assigned(0) > held);
    assert_eq!(builder.dispersion(), 0.0);
}

#[test]
fn draining_moves_one_replica_per_partition() {
    let mut builder = builder(8, 3, 5, 1);
    builder.rebalance().unwrap();
    let held = builder.assigned(4);
    assert!(held > 0);

    builder.drain(4).unwrap();
    let Rebalance { ring, diff, .. } = builder.rebalance().unwrap();

    let mut per_partition: BTreeMap<Partition, usize> = BTreeMap::new();
    for m in diff.moves() {
        *per_partition.entry(m.partition).or_default() += 1;
    }
    assert!(per_partition.values().all(|n| *n == 1));
    assert_eq!(diff.outgoing(4).count(), held);
    assert_eq!(builder.assigned(4), 0);

    // Drained, not removed: still known to the ring.
    assert_eq!(ring.device(4).map(|d| d.state), Some(DeviceState::Draining));
}

#[test]
fn replica_count_changes() {
    let mut builder = builder(8, 3, 4, 1);
    builder.rebalance().unwrap();

    builder.set_replicas(4).unwrap();
    let Rebalance { ring, diff, .. } = builder.rebalance().unwrap();
    assert_eq!(ring.replica_count(), 4);
    assert_eq!(diff.moved_replicas(), 256);
    assert!(diff.moves().iter().all(|m| m.replica == 3 && m.from.is_none()));
    for part in 0..256 {
        assert_eq!(zones_of(&ring, part).len(), 4);
    }

    builder.set_replicas(2).unwrap();
    let Rebalance { ring, .. } = builder.rebalance().unwrap();
    assert_eq!(ring.replica_count(), 2);
    assert_eq!(builder.dispersion(), 0.0);
}

#[test]
fn balance_reports_zero_weight_holders() {
    let mut builder = builder(6, 2, 3, 1);
    assert_eq!(builder.balance(), 0.0);
    builder.rebalance().unwrap();
    assert!(builder.balance() < 5.0);

    builder.set_weight(1, 0.0).unwrap();
    assert_eq!(builder.balance(), MAX_BALANCE);
}

#[test]
fn builder_from_deployed_ring() {
    let mut original = builder(6, 3, 3, 1);
    let ring = original.rebalance().unwrap().ring;

    let mut restored = RingBuilder::from_ring(&ring, &BuilderConfig::default()).unwrap();
    assert_eq!(restored.version(), ring.version());
    assert_eq!(restored.part_power(), 6);
    assert_eq!(restored.replicas(), 3);
    assert_eq!(restored.ring().unwrap().to_data(), ring.to_data());

    let id = restored
        .add_device(DeviceSpec::new("10.0.3.0:6200", "sdb", 100.0).zone(3))
        .unwrap();
    assert_eq!(id, 3);
    let next = restored.rebalance().unwrap();
    assert_eq!(next.ring.version(), ring.version() + 1);
    assert!(next.diff.incoming(id).count() > 0);
    assert_eq!(next.diff.from_version, ring.version());
}

#[test]
fn save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("object.builder.json");

    let mut builder = builder(6, 3, 3, 1);
    builder.rebalance().unwrap();
    builder.save(&path).unwrap();

    let loaded = RingBuilder::load(&path).unwrap();
    assert_eq!(loaded.version(), 1);
    assert_eq!(loaded.ring().unwrap().to_data(), builder.ring().unwrap().to_data());
}
