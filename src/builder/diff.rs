use {
    crate::{
        device::{DeviceId, NONE_DEVICE},
        hash::Partition,
    },
    serde::{Deserialize, Serialize},
    std::collections::BTreeSet,
};

/// A replica of a partition that changed device between two ring versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMove {
    pub partition: Partition,
    pub replica: usize,
    /// Previous holder; `None` for a newly added replica.
    pub from: Option<DeviceId>,
    pub to: DeviceId,
}

/// Exact set of `(partition, replica)` pairs whose device changed.
///
/// Consumed by replicators to schedule the affected partitions first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingDiff {
    pub from_version: u64,
    pub to_version: u64,
    moves: Vec<PartitionMove>,
}

impl RingDiff {
    /// Compares two assignment tables, `table[replica][partition]`.
    ///
    /// Replica rows that exist only in the old table produce no moves: there is
    /// no new holder to move data to.
    pub(crate) fn between(
        old: &[Vec<DeviceId>],
        new: &[Vec<DeviceId>],
        from_version: u64,
        to_version: u64,
    ) -> Self {
        let mut moves = Vec::new();
        for (replica, row) in new.iter().enumerate() {
            for (part, to) in row.iter().copied().enumerate() {
                let from = old
                    .get(replica)
                    .and_then(|old_row| old_row.get(part))
                    .copied()
                    .filter(|id| *id != NONE_DEVICE);
                if from != Some(to) {
                    moves.push(PartitionMove {
                        partition: part as Partition,
                        replica,
                        from,
                        to,
                    });
                }
            }
        }
        moves.sort_by_key(|m| (m.partition, m.replica));

        Self {
            from_version,
            to_version,
            moves,
        }
    }

    pub fn moves(&self) -> &[PartitionMove] {
        &self.moves
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Number of replica slots that changed device.
    pub fn moved_replicas(&self) -> usize {
        self.moves.len()
    }

    /// Number of distinct partitions with at least one moved replica.
    pub fn moved_partitions(&self) -> usize {
        self.partitions().len()
    }

    pub fn partitions(&self) -> BTreeSet<Partition> {
        self.moves.iter().map(|m| m.partition).collect()
    }

    /// Moves landing on the device: data it has to receive.
    pub fn incoming(&self, id: DeviceId) -> impl Iterator<Item = &PartitionMove> {
        self.moves.iter().filter(move |m| m.to == id)
    }

    /// Moves leaving the device: data it has to hand over.
    pub fn outgoing(&self, id: DeviceId) -> impl Iterator<Item = &PartitionMove> {
        self.moves.iter().filter(move |m| m.from == Some(id))
    }
}
