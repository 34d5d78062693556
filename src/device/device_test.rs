use super::*;

fn spec(i: u32) -> DeviceSpec {
    DeviceSpec::new(format!("10.0.0.{i}:6200"), "sda", 100.0).zone(i % 3)
}

#[test]
fn devices() {
    let mut table = DeviceTable::new();

    (0..5).for_each(|i| {
        let id = table.add(spec(i)).unwrap();
        assert_eq!(id, i as DeviceId);
        assert_eq!(table[id].address, format!("10.0.0.{i}:6200"));
        assert_eq!(table[id].state, DeviceState::Active);
    });
    assert_eq!(table.len(), 5);
    assert_eq!(table.zone_count(), 3);
    assert_eq!(table.region_count(), 1);
    assert_eq!(table.total_weight(), 500.0);

    // Same address and drive cannot be added twice.
    assert!(matches!(
        table.add(spec(2)),
        Err(RingError::DuplicateDevice(_))
    ));

    // Only removed devices can be purged; purged ids are reused.
    assert!(table.purge(3).is_none());
    table.remove(3).unwrap();
    assert_eq!(table.assignable().count(), 4);
    let purged = table.purge(3).unwrap();
    assert_eq!(purged.address, "10.0.0.3:6200");
    assert!(table.get(3).is_none());

    let reused = table
        .add(DeviceSpec::new("10.0.0.9:6200", "sdb", 40.0).zone(1))
        .unwrap();
    assert_eq!(reused, 3);
    assert_eq!(table[reused].drive, "sdb");
}

#[test]
fn state_transitions() {
    let mut table = DeviceTable::new();
    let id = table.add(spec(0)).unwrap();
    let v = table.version();

    table.drain(id).unwrap();
    assert_eq!(table[id].state, DeviceState::Draining);
    assert!(!table[id].is_assignable());
    assert!(table.version() > v);

    table.activate(id).unwrap();
    assert!(table[id].is_assignable());

    table.set_weight(id, 0.0).unwrap();
    assert!(!table[id].is_assignable());
    assert!(table.set_weight(id, -1.0).is_err());

    table.remove(id).unwrap();
    assert!(matches!(table.activate(id), Err(RingError::UnknownDevice(_))));
    assert!(matches!(table.drain(42), Err(RingError::UnknownDevice(42))));
}
