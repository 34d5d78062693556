use {
    rand::{Rng, SeedableRng, rngs::StdRng},
    replica_ring::{
        Config,
        DeviceSpec,
        Dispersion,
        RebalanceCommand,
        Ring,
        RingBuilder,
        RingError,
        RingHandle,
        TopologyChange,
        config::BuilderConfig,
        rebalance::plan,
    },
    std::{collections::HashSet, sync::Arc},
};

fn config(part_power: u8, replicas: usize) -> BuilderConfig {
    BuilderConfig {
        part_power,
        replicas,
        ..BuilderConfig::default()
    }
}

/// Deployed ring of `zones × per_zone` equal devices.
fn deployed(part_power: u8, replicas: usize, zones: u32, per_zone: u32) -> Ring {
    let mut builder = RingBuilder::new(&config(part_power, replicas)).unwrap();
    for zone in 0..zones {
        for n in 0..per_zone {
            let spec = DeviceSpec::new(format!("10.{zone}.0.{n}:6200"), "sdb", 100.0).zone(zone);
            builder.add_device(spec).unwrap();
        }
    }
    builder.rebalance().unwrap().ring
}

fn random_key(rng: &mut StdRng) -> String {
    format!("/acct/cont/obj-{:016x}", rng.r#gen::<u64>())
}

#[test]
fn lookups_are_stable_and_dispersed() {
    let ring = deployed(8, 3, 4, 2);
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..2_000 {
        let key = random_key(&mut rng);
        let devices = ring.devices_for(&key);
        assert_eq!(devices.len(), 3);

        let ids: HashSet<_> = devices.iter().map(|d| d.id).collect();
        assert_eq!(ids.len(), 3, "distinct devices for {key}");
        let zones: HashSet<_> = devices.iter().map(|d| d.zone).collect();
        assert_eq!(zones.len(), 3, "distinct zones for {key}");

        let again: Vec<_> = ring.devices_for(&key).iter().map(|d| d.id).collect();
        assert_eq!(again, devices.iter().map(|d| d.id).collect::<Vec<_>>());
    }
}

#[test]
fn keys_spread_uniformly() {
    let ring = deployed(8, 3, 3, 1);
    let mut rng = StdRng::seed_from_u64(42);
    let mut counts = vec![0usize; ring.partition_count()];
    let keys = 256 * 400;
    for _ in 0..keys {
        counts[ring.partition_for(random_key(&mut rng)) as usize] += 1;
    }

    // 400 expected per partition, standard deviation about 20.
    for (partition, count) in counts.iter().enumerate() {
        assert!((300..=500).contains(count), "partition {partition}: {count} keys");
    }
}

#[test]
fn weight_change_moves_proportionally() {
    let old = deployed(8, 3, 4, 3);
    let changes = [TopologyChange::SetWeight {
        device: 0,
        weight: 150.0,
    }];
    let rebalance = plan(&old, changes, &config(8, 3), Dispersion::Strict).unwrap();

    // |Δw| / total = 50 / 1250; moves are bounded by a small multiple of
    // that share of all replica slots, plus one rounding slot per device.
    let slots = 256 * 3;
    let bound = 2 * slots * 50 / 1250 + 12;
    let moved = rebalance.diff.moved_replicas();
    assert!(moved > 0 && moved <= bound, "moved {moved}, bound {bound}");
    assert!(rebalance.diff.moves().iter().all(|m| m.to == 0 || m.from != Some(0)));

    // Planning does not touch the deployed ring.
    assert_eq!(old.version(), 1);
    assert_eq!(rebalance.ring.version(), 2);
}

#[test]
fn four_devices_one_removed() {
    let old = deployed(8, 3, 4, 1);
    let held = old.partitions_for_device(3).len();
    assert_eq!(held, 192);

    let rebalance = plan(
        &old,
        [TopologyChange::Remove(3)],
        &config(8, 3),
        Dispersion::Strict,
    )
    .unwrap();
    let new = &rebalance.ring;

    // Only the removed device's quarter of the slots moved.
    assert_eq!(rebalance.diff.moved_replicas(), held);
    assert!(rebalance.diff.moves().iter().all(|m| m.from == Some(3)));
    for partition in 0..256 {
        for id in old.primary_ids(partition) {
            if id != 3 {
                assert!(new.is_primary(partition, id));
            }
        }
        let ids: HashSet<_> = new.primary_ids(partition).into_iter().collect();
        assert_eq!(ids, HashSet::from([0, 1, 2]));
    }
}

#[test]
fn infeasible_rebalance_is_rejected() {
    let old = deployed(6, 3, 3, 1);
    let result = plan(
        &old,
        [TopologyChange::Remove(2)],
        &config(6, 3),
        Dispersion::Strict,
    );
    assert!(matches!(result, Err(RingError::InfeasiblePlacement { .. })));

    // Degraded placement is the caller's call.
    let degraded = plan(
        &old,
        [TopologyChange::Remove(2)],
        &config(6, 3),
        Dispersion::Degraded,
    );
    assert!(matches!(degraded, Err(RingError::InfeasiblePlacement { .. })));
}

#[test]
fn command_swaps_ring_under_readers() {
    let config = Config::from_toml_str(
        r#"
        [builder]
        part_power = 6
        hash_prefix = "cluster-a"
        "#,
    )
    .unwrap();
    let mut builder = RingBuilder::new(&config.builder).unwrap();
    for zone in 0..3 {
        builder
            .add_device(DeviceSpec::new(format!("10.0.0.{zone}:6200"), "sdb", 100.0).zone(zone))
            .unwrap();
    }
    let handle = Arc::new(RingHandle::new(builder.rebalance().unwrap().ring));
    let command = RebalanceCommand::new(builder, handle.clone());

    let reader = handle.snapshot();
    let before: Vec<_> = reader.devices_for("a/c/o").iter().map(|d| d.id).collect();

    let spec = DeviceSpec::new("10.0.0.3:6200", "sdb", 100.0).zone(3);
    let summary = command
        .apply([TopologyChange::Add(spec)], Dispersion::Strict)
        .unwrap();
    assert_eq!(summary.version, 2);
    assert!(summary.moved_replicas > 0);
    assert!(summary.to_string().starts_with("ring v2"));

    // The reader keeps its version; new lookups see the new one.
    assert_eq!(reader.version(), 1);
    let still: Vec<_> = reader.devices_for("a/c/o").iter().map(|d| d.id).collect();
    assert_eq!(before, still);
    assert_eq!(handle.snapshot().version(), 2);
    assert!(handle.snapshot().device(3).is_some());
    assert_eq!(command.builder().version(), 2);
}
