use {
    crate::{device::DeviceId, hash::Partition},
    std::collections::HashMap,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PeerState {
    /// Consecutive failures.
    failures: u32,
    /// First cycle at which the pair is tried again.
    retry_at: u64,
}

/// Retry schedule per (partition, peer) pair, counted in replication cycles.
///
/// After `k` consecutive failures a pair is skipped for
/// `min(2^(k-1), max_cycles)` cycles, so the first failure is retried on the
/// very next cycle. One pair failing never delays another.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    max_cycles: u64,
    pairs: HashMap<(Partition, DeviceId), PeerState>,
}

impl Backoff {
    pub(crate) fn new(max_cycles: u64) -> Self {
        Self {
            max_cycles: max_cycles.max(1),
            pairs: HashMap::new(),
        }
    }

    pub(crate) fn should_skip(&self, partition: Partition, peer: DeviceId, cycle: u64) -> bool {
        self.pairs
            .get(&(partition, peer))
            .is_some_and(|state| cycle < state.retry_at)
    }

    /// Records a failure during `cycle`, returning the consecutive count.
    pub(crate) fn failure(&mut self, partition: Partition, peer: DeviceId, cycle: u64) -> u32 {
        let state = self.pairs.entry((partition, peer)).or_default();
        state.failures = state.failures.saturating_add(1);
        let exponent = (state.failures - 1).min(63);
        let delay = 1u64.checked_shl(exponent).unwrap_or(u64::MAX).min(self.max_cycles);
        state.retry_at = cycle.saturating_add(delay);
        state.failures
    }

    pub(crate) fn success(&mut self, partition: Partition, peer: DeviceId) {
        self.pairs.remove(&(partition, peer));
    }

    pub(crate) fn failures(&self, partition: Partition, peer: DeviceId) -> u32 {
        self.pairs.get(&(partition, peer)).map_or(0, |s| s.failures)
    }

    /// Peers with at least `threshold` consecutive failures on some partition.
    pub(crate) fn unhealthy_peers(&self, threshold: u32) -> Vec<DeviceId> {
        let mut peers: Vec<DeviceId> = self
            .pairs
            .iter()
            .filter(|(_, state)| state.failures >= threshold)
            .map(|((_, peer), _)| *peer)
            .collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }
}
