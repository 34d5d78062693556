//! Per-device background replication.
//!
//! Each cycle a [`Replicator`] first pushes data it holds on behalf of other
//! devices (handoff entries) to where it belongs, then walks every partition
//! it stores or is primary for. Primary partitions are compared with each
//! peer primary through [`Fingerprint`]s and only the differing objects are
//! exchanged; partitions the device is no longer primary for are pushed in
//! full to their primaries and dropped locally.

mod backoff;
pub mod fingerprint;
mod job;


use {
    crate::{
        RingError,
        RingResult,
        builder::RingDiff,
        config::ReplicatorConfig,
        coordinator::{HandoffEntry, HandoffLog, quorum::bounded},
        device::DeviceId,
        hash::Partition,
        ring::{Ring, RingHandle},
        store::{ObjectMeta, ObjectStore},
        timestamp::Timestamp,
        transport::{BulkTransfer, ReplicaClient, TransferOutcome, TransferRequest},
    },
    backoff::Backoff,
    futures::{StreamExt, stream},
    job::{Priority, WorkQueue},
    parking_lot::Mutex,
    serde::{Deserialize, Serialize},
    std::{
        collections::{BTreeMap, BTreeSet, HashMap, HashSet},
        sync::{
            Arc,
            atomic::{AtomicU64, AtomicUsize, Ordering},
        },
    },
    tokio::{
        sync::{Semaphore, watch},
        time::{MissedTickBehavior, timeout},
    },
    tracing::{debug, info, warn},
};

pub use {
    fingerprint::{Fingerprint, bucket_of},
    job::{JobKind, ReplicationJob},
};

/// Replication state of one partition on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    InSync,
    /// Not yet compared with every peer.
    Scanning,
    /// A peer lacks objects held here.
    NeedsPush,
    /// This device lacks objects held by a peer.
    NeedsPull,
    /// A transfer to or from a peer is running or did not finish.
    Repairing,
}

/// Counters of one replication cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    pub partitions: usize,
    pub handoffs_delivered: usize,
    pub objects_pushed: usize,
    pub objects_pulled: usize,
    pub partitions_reverted: usize,
    /// (partition, peer) pairs skipped because of backoff.
    pub deferred: usize,
    pub failures: usize,
    pub quarantined: usize,
    pub reclaimed: usize,
}

impl CycleStats {
    fn merge(&mut self, other: CycleStats) {
        self.partitions += other.partitions;
        self.handoffs_delivered += other.handoffs_delivered;
        self.objects_pushed += other.objects_pushed;
        self.objects_pulled += other.objects_pulled;
        self.partitions_reverted += other.partitions_reverted;
        self.deferred += other.deferred;
        self.failures += other.failures;
        self.quarantined += other.quarantined;
        self.reclaimed += other.reclaimed;
    }
}

/// Sync-lag counters of a device, for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLagReport {
    pub device: DeviceId,
    /// Completed replication cycles.
    pub cycles: u64,
    /// Partitions whose last pass left them out of sync.
    pub partitions_pending_repair: usize,
    /// Handoff entries whose data sits on this device.
    pub handoff_backlog: usize,
    /// Jobs deferred by backoff during the last cycle.
    pub deferred_jobs: usize,
    /// Peers that failed at least `alert_threshold` times in a row.
    pub unhealthy_peers: Vec<DeviceId>,
    pub quarantined: usize,
}

/// Background replicator of one device.
pub struct Replicator {
    device: DeviceId,
    ring: Arc<RingHandle>,
    store: Arc<dyn ObjectStore>,
    client: Arc<dyn ReplicaClient>,
    transfer: Arc<dyn BulkTransfer>,
    handoffs: Arc<HandoffLog>,
    config: ReplicatorConfig,
    backoff: Mutex<Backoff>,
    urgent: Mutex<BTreeSet<Partition>>,
    states: Mutex<BTreeMap<Partition, PartitionState>>,
    /// Caps bulk transfers in flight, including timed out ones still running.
    connections: Arc<Semaphore>,
    cycles: AtomicU64,
    deferred: AtomicUsize,
}

impl Replicator {
    pub fn new(
        device: DeviceId,
        ring: Arc<RingHandle>,
        store: Arc<dyn ObjectStore>,
        client: Arc<dyn ReplicaClient>,
        transfer: Arc<dyn BulkTransfer>,
        handoffs: Arc<HandoffLog>,
        config: ReplicatorConfig,
    ) -> RingResult<Self> {
        config.validate()?;
        Ok(Self {
            device,
            ring,
            store,
            client,
            transfer,
            handoffs,
            backoff: Mutex::new(Backoff::new(config.max_backoff_cycles)),
            urgent: Mutex::new(BTreeSet::new()),
            states: Mutex::new(BTreeMap::new()),
            connections: Arc::new(Semaphore::new(config.max_connections)),
            cycles: AtomicU64::new(0),
            deferred: AtomicUsize::new(0),
            config,
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Schedules the partitions touched by a rebalance ahead of the others on
    /// the next cycle.
    pub fn prioritize(&self, diff: &RingDiff) {
        let mut urgent = self.urgent.lock();
        urgent.extend(diff.partitions());
        debug!(device = self.device, urgent = urgent.len(), "partitions prioritized");
    }

    pub fn state(&self, partition: Partition) -> Option<PartitionState> {
        self.states.lock().get(&partition).copied()
    }

    pub fn report(&self) -> SyncLagReport {
        SyncLagReport {
            device: self.device,
            cycles: self.cycles.load(Ordering::Relaxed),
            partitions_pending_repair: self
                .states
                .lock()
                .values()
                .filter(|state| **state != PartitionState::InSync)
                .count(),
            handoff_backlog: self.handoffs.held_by(self.device).len(),
            deferred_jobs: self.deferred.load(Ordering::Relaxed),
            unhealthy_peers: self.backoff.lock().unhealthy_peers(self.config.alert_threshold),
            quarantined: self.store.quarantined(),
        }
    }

    /// Runs cycles every `interval` until `shutdown` turns true or its sender
    /// goes away.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(device = self.device, interval = ?self.config.interval(), "replicator started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(device = self.device, "replicator stopped");
    }

    /// One replication cycle.
    ///
    /// Failures are absorbed per (partition, peer) pair and retried on a
    /// later cycle; they never abort the cycle.
    pub async fn run_once(&self) -> CycleStats {
        let cycle = self.cycles.load(Ordering::Relaxed);
        let ring = self.ring.snapshot();
        let mut stats = CycleStats::default();

        self.deliver_handoffs(&ring, cycle, &mut stats).await;

        let queue = self.schedule(&ring);
        let results: Vec<CycleStats> = stream::iter(queue.into_ordered())
            .map(|(_, partition)| self.replicate_partition(&ring, partition, cycle))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;
        for partition_stats in results {
            stats.merge(partition_stats);
        }

        self.deferred.store(stats.deferred, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);
        info!(
            device = self.device,
            cycle,
            partitions = stats.partitions,
            pushed = stats.objects_pushed,
            pulled = stats.objects_pulled,
            handoffs = stats.handoffs_delivered,
            deferred = stats.deferred,
            failures = stats.failures,
            "replication cycle done"
        );
        stats
    }

    /// Partitions to process this cycle: stored locally or assigned here.
    fn schedule(&self, ring: &Ring) -> WorkQueue {
        let local = self.store.partitions().unwrap_or_else(|err| {
            warn!(device = self.device, %err, "cannot list local partitions");
            Vec::new()
        });
        let urgent = std::mem::take(&mut *self.urgent.lock());
        let mut queue = WorkQueue::default();
        for partition in ring.partitions_for_device(self.device).into_iter().chain(local) {
            let priority = if urgent.contains(&partition) {
                Priority::Urgent
            } else {
                Priority::Normal
            };
            queue.push(priority, partition);
        }
        queue
    }

    async fn replicate_partition(&self, ring: &Ring, partition: Partition, cycle: u64) -> CycleStats {
        if ring.is_primary(partition, self.device) {
            self.sync_partition(ring, partition, cycle).await
        } else {
            self.revert_partition(ring, partition, cycle).await
        }
    }

    /// Pushes handoff data held here to its intended primary, or to the
    /// current primaries when the intended device lost that role. Entries
    /// are purged once every target has the object.
    async fn deliver_handoffs(&self, ring: &Ring, cycle: u64, stats: &mut CycleStats) {
        let held = self.handoffs.held_by(self.device);
        if held.is_empty() {
            return;
        }

        let mut jobs: BTreeMap<(Partition, DeviceId), BTreeSet<String>> = BTreeMap::new();
        let mut routes: Vec<(HandoffEntry, Vec<DeviceId>)> = Vec::with_capacity(held.len());
        for entry in held {
            let targets: Vec<DeviceId> = if ring.is_primary(entry.partition, entry.intended) {
                vec![entry.intended]
            } else {
                ring.primary_ids(entry.partition)
                    .into_iter()
                    .filter(|id| *id != self.device)
                    .collect()
            };
            for target in &targets {
                jobs.entry((entry.partition, *target))
                    .or_default()
                    .insert(entry.name.clone());
            }
            routes.push((entry, targets));
        }

        let mut delivered: HashSet<(Partition, DeviceId, String)> = HashSet::new();
        for ((partition, target), names) in jobs {
            if self.backoff.lock().should_skip(partition, target, cycle) {
                stats.deferred += 1;
                continue;
            }
            let job = ReplicationJob {
                partition,
                source: self.device,
                target,
                kind: JobKind::DeltaSync,
            };
            match self.run_transfer(job.request(names.into_iter().collect())).await {
                Ok(outcome) => {
                    self.backoff.lock().success(partition, target);
                    stats.objects_pushed += outcome.transferred.len();
                    delivered.extend(outcome.transferred.into_iter().map(|name| (partition, target, name)));
                }
                Err(err) => {
                    self.peer_failed(partition, target, cycle, &err);
                    stats.failures += 1;
                }
            }
        }

        for (entry, targets) in routes {
            let done = !targets.is_empty()
                && targets
                    .iter()
                    .all(|t| delivered.contains(&(entry.partition, *t, entry.name.clone())));
            if done && self.handoffs.complete(&entry) {
                debug!(device = self.device, partition = entry.partition, name = %entry.name, "handoff delivered");
                stats.handoffs_delivered += 1;
            }
        }
    }

    /// Audits a primary partition, then reconciles it with every peer.
    async fn sync_partition(&self, ring: &Ring, partition: Partition, cycle: u64) -> CycleStats {
        let mut stats = CycleStats {
            partitions: 1,
            ..CycleStats::default()
        };
        self.set_state(partition, PartitionState::Scanning);

        match self.store.audit(partition) {
            Ok(corrupt) => {
                for name in corrupt {
                    warn!(device = self.device, partition, %name, "quarantining corrupt object");
                    match self.store.quarantine(partition, &name) {
                        Ok(()) => stats.quarantined += 1,
                        Err(err) => warn!(device = self.device, partition, %err, "quarantine failed"),
                    }
                }
            }
            Err(err) => warn!(device = self.device, partition, %err, "audit failed"),
        }

        let local = match self.store.list(partition) {
            Ok(local) => local,
            Err(err) => {
                warn!(device = self.device, partition, %err, "cannot list partition");
                stats.failures += 1;
                return stats;
            }
        };
        let fingerprint = Fingerprint::of(&local, self.config.fingerprint_buckets);

        let mut unverified = false;
        let mut repair_failed = false;
        let peers = ring.primary_ids(partition).into_iter().filter(|id| *id != self.device);
        for peer in peers {
            if self.backoff.lock().should_skip(partition, peer, cycle) {
                stats.deferred += 1;
                unverified = true;
                continue;
            }
            let (push, pull) = match self.compare(partition, peer, &local, &fingerprint).await {
                Ok(delta) => delta,
                Err(err) => {
                    self.peer_failed(partition, peer, cycle, &err);
                    stats.failures += 1;
                    unverified = true;
                    continue;
                }
            };
            if push.is_empty() && pull.is_empty() {
                self.backoff.lock().success(partition, peer);
                continue;
            }
            match self.repair(partition, peer, push, pull, &mut stats).await {
                Ok(complete) => {
                    self.backoff.lock().success(partition, peer);
                    repair_failed |= !complete;
                }
                Err(err) => {
                    self.peer_failed(partition, peer, cycle, &err);
                    stats.failures += 1;
                    repair_failed = true;
                }
            }
        }

        match self.store.reclaim(partition, self.config.reclaim_age(), Timestamp::now()) {
            Ok(reclaimed) => stats.reclaimed += reclaimed,
            Err(err) => warn!(device = self.device, partition, %err, "tombstone reclaim failed"),
        }

        let state = if repair_failed {
            PartitionState::Repairing
        } else if unverified {
            PartitionState::Scanning
        } else {
            PartitionState::InSync
        };
        self.set_state(partition, state);
        stats
    }

    /// Names to push to and pull from `peer`, found by comparing fingerprints
    /// and then listing only the differing buckets.
    async fn compare(
        &self,
        partition: Partition,
        peer: DeviceId,
        local: &[ObjectMeta],
        fingerprint: &Fingerprint,
    ) -> RingResult<(Vec<String>, Vec<String>)> {
        let buckets = self.config.fingerprint_buckets;
        let limit = self.config.node_timeout();
        let remote = bounded(limit, self.client.fingerprint(peer, partition, buckets)).await?;
        let differing = fingerprint.diff(&remote);
        if differing.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let manifest = bounded(
            limit,
            self.client.manifest(peer, partition, &differing, buckets),
        )
        .await?;
        let (push, pull) = self.delta(local, manifest, &differing);
        debug!(
            device = self.device,
            peer,
            partition,
            buckets = differing.len(),
            push = push.len(),
            pull = pull.len(),
            "fingerprints differ"
        );
        Ok((push, pull))
    }

    /// Copies the differing objects both ways.
    ///
    /// Returns whether every one of them was transferred.
    async fn repair(
        &self,
        partition: Partition,
        peer: DeviceId,
        push: Vec<String>,
        pull: Vec<String>,
        stats: &mut CycleStats,
    ) -> RingResult<bool> {
        let needs = if push.is_empty() {
            PartitionState::NeedsPull
        } else {
            PartitionState::NeedsPush
        };
        self.set_state(partition, needs);

        let mut complete = true;
        if !push.is_empty() {
            let job = ReplicationJob {
                partition,
                source: self.device,
                target: peer,
                kind: JobKind::DeltaSync,
            };
            self.set_state(partition, PartitionState::Repairing);
            let outcome = self.run_transfer(job.request(push)).await?;
            stats.objects_pushed += outcome.transferred.len();
            complete &= outcome.is_complete();
        }
        if !pull.is_empty() {
            let job = ReplicationJob {
                partition,
                source: peer,
                target: self.device,
                kind: JobKind::DeltaSync,
            };
            self.set_state(partition, PartitionState::Repairing);
            let outcome = self.run_transfer(job.request(pull)).await?;
            stats.objects_pulled += outcome.transferred.len();
            complete &= outcome.is_complete();
        }
        Ok(complete)
    }

    /// Names to push to and pull from a peer, given the peer's listing of the
    /// differing buckets. Tombstones past the reclaim age travel nowhere.
    fn delta(
        &self,
        local: &[ObjectMeta],
        remote: Vec<ObjectMeta>,
        differing: &[u16],
    ) -> (Vec<String>, Vec<String>) {
        let policy = self.store.policy();
        let buckets = self.config.fingerprint_buckets;
        let age = self.config.reclaim_age();
        let now = Timestamp::now();
        let differing: HashSet<u16> = differing.iter().copied().collect();

        let local: HashMap<&str, &ObjectMeta> = local
            .iter()
            .filter(|meta| differing.contains(&bucket_of(&meta.name, buckets)))
            .map(|meta| (meta.name.as_str(), meta))
            .collect();
        let remote: HashMap<&str, &ObjectMeta> =
            remote.iter().map(|meta| (meta.name.as_str(), meta)).collect();

        let mut push: Vec<String> = local
            .iter()
            .filter(|(_, meta)| !meta.is_reclaimable(age, now))
            .filter(|(name, meta)| remote.get(*name).is_none_or(|r| meta.supersedes(r, policy)))
            .map(|(name, _)| name.to_string())
            .collect();
        let mut pull: Vec<String> = remote
            .iter()
            .filter(|(_, meta)| !meta.is_reclaimable(age, now))
            .filter(|(name, meta)| local.get(*name).is_none_or(|l| meta.supersedes(l, policy)))
            .map(|(name, _)| name.to_string())
            .collect();
        push.sort_unstable();
        pull.sort_unstable();
        (push, pull)
    }

    /// Pushes a partition this device is not primary for to all primaries,
    /// then drops it locally once every primary has everything.
    async fn revert_partition(&self, ring: &Ring, partition: Partition, cycle: u64) -> CycleStats {
        let mut stats = CycleStats {
            partitions: 1,
            ..CycleStats::default()
        };
        let local = match self.store.list(partition) {
            Ok(local) => local,
            Err(err) => {
                warn!(device = self.device, partition, %err, "cannot list partition");
                stats.failures += 1;
                return stats;
            }
        };
        let age = self.config.reclaim_age();
        let now = Timestamp::now();
        let names: Vec<String> = local
            .into_iter()
            .filter(|meta| !meta.is_reclaimable(age, now))
            .map(|meta| meta.name)
            .collect();
        self.set_state(partition, PartitionState::NeedsPush);

        let primaries = ring.primary_ids(partition);
        let mut reverted = !primaries.is_empty();
        let mut repair_failed = false;
        for target in primaries {
            if self.backoff.lock().should_skip(partition, target, cycle) {
                stats.deferred += 1;
                reverted = false;
                continue;
            }
            if names.is_empty() {
                continue;
            }
            let job = ReplicationJob {
                partition,
                source: self.device,
                target,
                kind: JobKind::FullSync,
            };
            self.set_state(partition, PartitionState::Repairing);
            match self.run_transfer(job.request(names.clone())).await {
                Ok(outcome) => {
                    self.backoff.lock().success(partition, target);
                    stats.objects_pushed += outcome.transferred.len();
                    reverted &= outcome.is_complete();
                    repair_failed |= !outcome.is_complete();
                }
                Err(err) => {
                    self.peer_failed(partition, target, cycle, &err);
                    stats.failures += 1;
                    reverted = false;
                    repair_failed = true;
                }
            }
        }

        if !reverted {
            let state = if repair_failed {
                PartitionState::Repairing
            } else {
                PartitionState::NeedsPush
            };
            self.set_state(partition, state);
            return stats;
        }
        if let Err(err) = self.store.remove_partition(partition) {
            warn!(device = self.device, partition, %err, "cannot remove reverted partition");
            stats.failures += 1;
            return stats;
        }
        for entry in self.handoffs.held_by(self.device) {
            if entry.partition == partition && self.handoffs.complete(&entry) {
                stats.handoffs_delivered += 1;
            }
        }
        self.states.lock().remove(&partition);
        stats.partitions_reverted += 1;
        info!(device = self.device, partition, objects = names.len(), "partition reverted");
        stats
    }

    /// Runs a blocking bulk transfer off the async workers, bounded by the
    /// node timeout.
    ///
    /// The connection slot belongs to the blocking task: a transfer that
    /// outlives its timeout keeps its slot until it actually ends.
    async fn run_transfer(&self, request: TransferRequest) -> RingResult<TransferOutcome> {
        let permit = self
            .connections
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| RingError::Io(std::io::Error::other(err)))?;
        let (kind, partition, source, target) =
            (request.kind, request.partition, request.source, request.target);
        let transfer = self.transfer.clone();
        let task = tokio::task::spawn_blocking(move || {
            let outcome = transfer.transfer(&request);
            drop(permit);
            outcome
        });
        let result = match timeout(self.config.node_timeout(), task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => Err(RingError::Io(std::io::Error::other(err))),
            Err(_) => Err(RingError::Timeout),
        };
        match (&result, kind) {
            (Ok(outcome), JobKind::FullSync) => {
                info!(partition, source, target, objects = outcome.transferred.len(), "full sync done")
            }
            (Ok(outcome), JobKind::DeltaSync) => {
                debug!(partition, source, target, objects = outcome.transferred.len(), "delta sync done")
            }
            (Err(err), _) => debug!(partition, source, target, ?kind, %err, "transfer failed"),
        }
        result
    }

    fn peer_failed(&self, partition: Partition, peer: DeviceId, cycle: u64, err: &RingError) {
        let failures = self.backoff.lock().failure(partition, peer, cycle);
        if failures == self.config.alert_threshold {
            warn!(device = self.device, peer, partition, failures, %err, "peer persistently failing");
        } else {
            debug!(device = self.device, peer, partition, failures, %err, "replication deferred");
        }
    }

    fn set_state(&self, partition: Partition, state: PartitionState) {
        let previous = self.states.lock().insert(partition, state);
        if previous != Some(state) {
            debug!(device = self.device, partition, ?previous, ?state, "partition state");
        }
    }
}
