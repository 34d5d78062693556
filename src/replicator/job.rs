use {
    crate::{device::DeviceId, hash::Partition, transport::TransferRequest},
    serde::{Deserialize, Serialize},
    std::{
        cmp::Reverse,
        collections::{BinaryHeap, HashSet},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Every object of the partition is copied.
    FullSync,
    /// Only objects found to differ are copied.
    DeltaSync,
}

/// One copy of partition data from a source to a target device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationJob {
    pub partition: Partition,
    pub source: DeviceId,
    pub target: DeviceId,
    pub kind: JobKind,
}

impl ReplicationJob {
    pub fn request(&self, names: Vec<String>) -> TransferRequest {
        TransferRequest {
            partition: self.partition,
            source: self.source,
            target: self.target,
            kind: self.kind,
            names,
        }
    }
}

/// Scheduling class of a partition within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Priority {
    /// Assignment changed by the last rebalance.
    Urgent,
    Normal,
}

/// Partitions to process in one cycle, urgent ones first, each at most once.
#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    heap: BinaryHeap<Reverse<(Priority, Partition)>>,
    queued: HashSet<Partition>,
}

impl WorkQueue {
    pub(crate) fn push(&mut self, priority: Priority, partition: Partition) {
        if self.queued.insert(partition) {
            self.heap.push(Reverse((priority, partition)));
        } else if priority == Priority::Urgent {
            // Upgrade: the normal entry is skipped when popped.
            self.heap.push(Reverse((priority, partition)));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queued.len()
    }

    /// Drains the queue in scheduling order.
    pub(crate) fn into_ordered(mut self) -> Vec<(Priority, Partition)> {
        let mut ordered = Vec::with_capacity(self.queued.len());
        while let Some(Reverse((priority, partition))) = self.heap.pop() {
            if self.queued.remove(&partition) {
                ordered.push((priority, partition));
            }
        }
        ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgent_partitions_first() {
        let mut queue = WorkQueue::default();
        for partition in [5, 1, 9] {
            queue.push(Priority::Normal, partition);
        }
        queue.push(Priority::Urgent, 9);
        queue.push(Priority::Urgent, 3);
        queue.push(Priority::Normal, 3);
        assert_eq!(queue.len(), 4);

        assert_eq!(queue.into_ordered(), vec![
            (Priority::Urgent, 3),
            (Priority::Urgent, 9),
            (Priority::Normal, 1),
            (Priority::Normal, 5),
        ]);
    }

    #[test]
    fn job_request() {
        let job = ReplicationJob {
            partition: 4,
            source: 1,
            target: 2,
            kind: JobKind::FullSync,
        };
        let request = job.request(vec!["a".to_string()]);
        assert_eq!((request.partition, request.source, request.target), (4, 1, 2));
        assert_eq!(request.kind, JobKind::FullSync);
        assert_eq!(request.names, vec!["a"]);
    }
}
