//! Per-request replication.
//!
//! Writes fan out to every primary of the key's partition and succeed at
//! quorum; a primary that fails is replaced by the next fallback device of
//! the ring and a handoff entry is recorded for it. Reads fan out to the
//! primaries, return the newest copy under the conflict policy and repair
//! stale replicas in the background.

pub mod handoff;
pub mod limiter;
pub(crate) mod quorum;


use {
    crate::{
        RingError,
        RingResult,
        config::CoordinatorConfig,
        device::DeviceId,
        hash::Partition,
        ring::RingHandle,
        store::ObjectRecord,
        timestamp::{Timestamp, Version},
        transport::ReplicaClient,
    },
    futures::stream::FuturesUnordered,
    parking_lot::Mutex,
    quorum::{bounded, gather},
    std::{cmp::Ordering, sync::Arc},
    tokio::task::JoinSet,
    tracing::{debug, warn},
};

pub use {
    handoff::{HandoffEntry, HandoffLog},
    limiter::ErrorLimiter,
};

/// Result of a successful write or delete.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub partition: Partition,
    pub version: Version,
    /// Primaries that acknowledged.
    pub acked: Vec<DeviceId>,
    /// Primaries that failed or were skipped.
    pub failed: Vec<DeviceId>,
    /// Primaries still writing when the post-quorum grace ended. Their copy
    /// is left to the replicator.
    pub abandoned: Vec<DeviceId>,
    /// Fallback writes standing in for failed primaries.
    pub handoffs: Vec<HandoffEntry>,
}

impl WriteOutcome {
    /// Acknowledgements counted towards quorum.
    pub fn acks(&self) -> usize {
        self.acked.len() + self.handoffs.len()
    }
}

/// Result of a successful read.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub partition: Partition,
    /// Newest copy among the responses, tombstones included.
    pub newest: Option<ObjectRecord>,
    /// Devices that answered, with or without the object.
    pub responded: Vec<DeviceId>,
    /// Devices being repaired in the background.
    pub repairing: Vec<DeviceId>,
}

impl ReadOutcome {
    /// Payload of the object, `None` when it does not exist or was deleted.
    pub fn value(&self) -> Option<&[u8]> {
        self.newest
            .as_ref()
            .filter(|r| !r.tombstone)
            .map(|r| r.payload.as_slice())
    }

    pub fn is_deleted(&self) -> bool {
        self.newest.as_ref().is_some_and(|r| r.tombstone)
    }

    pub fn version(&self) -> Option<Version> {
        self.newest.as_ref().map(|r| r.version)
    }
}

/// Quorum coordinator.
pub struct Coordinator {
    ring: Arc<RingHandle>,
    client: Arc<dyn ReplicaClient>,
    handoffs: Arc<HandoffLog>,
    limiter: ErrorLimiter,
    config: CoordinatorConfig,
    /// Identity stamped into every version written, breaks timestamp ties.
    origin: u64,
    repairs: Mutex<JoinSet<()>>,
}

impl Coordinator {
    pub fn new(
        ring: Arc<RingHandle>,
        client: Arc<dyn ReplicaClient>,
        handoffs: Arc<HandoffLog>,
        config: CoordinatorConfig,
        origin: u64,
    ) -> Self {
        let limiter = ErrorLimiter::new(
            config.error_suppression_limit,
            config.error_suppression_interval(),
        );
        Self {
            ring,
            client,
            handoffs,
            limiter,
            config,
            origin,
            repairs: Mutex::new(JoinSet::new()),
        }
    }

    pub fn limiter(&self) -> &ErrorLimiter {
        &self.limiter
    }

    pub fn handoffs(&self) -> &Arc<HandoffLog> {
        &self.handoffs
    }

    pub async fn write(&self, name: &str, payload: impl Into<Vec<u8>>) -> RingResult<WriteOutcome> {
        self.write_at(name, payload, Timestamp::now()).await
    }

    pub async fn write_at(
        &self,
        name: &str,
        payload: impl Into<Vec<u8>>,
        timestamp: Timestamp,
    ) -> RingResult<WriteOutcome> {
        let version = Version::new(timestamp, self.origin);
        self.replicate(ObjectRecord::new(name, version, payload)).await
    }

    /// Writes a tombstone.
    pub async fn delete(&self, name: &str) -> RingResult<WriteOutcome> {
        self.delete_at(name, Timestamp::now()).await
    }

    pub async fn delete_at(&self, name: &str, timestamp: Timestamp) -> RingResult<WriteOutcome> {
        let version = Version::new(timestamp, self.origin);
        self.replicate(ObjectRecord::tombstone(name, version)).await
    }

    async fn put_to(
        &self,
        device: DeviceId,
        intended: Option<DeviceId>,
        partition: Partition,
        record: ObjectRecord,
    ) -> (DeviceId, Option<DeviceId>, RingResult<bool>) {
        let call = self.client.put(device, partition, record);
        (device, intended, bounded(self.config.node_timeout(), call).await)
    }

    async fn replicate(&self, record: ObjectRecord) -> RingResult<WriteOutcome> {
        let ring = self.ring.snapshot();
        let partition = ring.partition_for(&record.name);
        let primaries = ring.primary_ids(partition);
        let quorum = self.config.write_quorum.size(primaries.len());
        let max_handoffs = self
            .config
            .max_handoffs_per_request
            .unwrap_or(primaries.len());
        let handoff_devices = ring.handoff_devices(partition);
        let mut fallbacks = handoff_devices
            .iter()
            .map(|d| d.id)
            .filter(|id| !self.limiter.is_limited(*id))
            .take(max_handoffs);

        let mut outcome = WriteOutcome {
            partition,
            version: record.version,
            acked: Vec::new(),
            failed: Vec::new(),
            abandoned: Vec::new(),
            handoffs: Vec::new(),
        };
        let pending = FuturesUnordered::new();
        for &device in &primaries {
            if self.limiter.is_limited(device) {
                debug!(device, partition, "skipping error limited primary");
                outcome.failed.push(device);
                if let Some(fallback) = fallbacks.next() {
                    pending.push(self.put_to(fallback, Some(device), partition, record.clone()));
                }
            } else {
                pending.push(self.put_to(device, None, partition, record.clone()));
            }
        }

        let grace = self.config.post_quorum_timeout();
        let acks = gather(pending, quorum, grace, |(device, intended, result), pending| {
            match result {
                Ok(_) => {
                    match intended {
                        None => outcome.acked.push(device),
                        Some(intended) => {
                            let entry = HandoffEntry {
                                partition,
                                intended,
                                actual: device,
                                name: record.name.clone(),
                                timestamp: record.version.timestamp,
                            };
                            self.handoffs.record(entry.clone());
                            outcome.handoffs.push(entry);
                        }
                    }
                    true
                }
                Err(err) => {
                    self.limiter.increment(device);
                    debug!(device, partition, %err, "replica write failed");
                    if intended.is_none() {
                        outcome.failed.push(device);
                    }
                    let intended = intended.unwrap_or(device);
                    if let Some(fallback) = fallbacks.next() {
                        pending.push(self.put_to(fallback, Some(intended), partition, record.clone()));
                    }
                    false
                }
            }
        })
        .await;

        outcome.abandoned = primaries
            .iter()
            .copied()
            .filter(|id| !outcome.acked.contains(id) && !outcome.failed.contains(id))
            .collect();
        if !outcome.abandoned.is_empty() {
            debug!(partition, abandoned = ?outcome.abandoned, "replica writes abandoned after grace");
        }

        if acks < quorum {
            warn!(name = %record.name, partition, acks, quorum, "write quorum not met");
            return Err(RingError::QuorumNotMet {
                needed: quorum,
                got: acks,
            });
        }
        Ok(outcome)
    }

    async fn get_from(
        &self,
        device: DeviceId,
        partition: Partition,
        name: &str,
    ) -> (DeviceId, RingResult<Option<ObjectRecord>>) {
        let call = self.client.get(device, partition, name);
        (device, bounded(self.config.node_timeout(), call).await)
    }

    /// Reads the newest copy of an object.
    ///
    /// Replicas that fail or return a copy failing verification are replaced
    /// by the next primary or fallback device. Only primaries can vouch for
    /// an object's absence: a fallback's miss does not count towards quorum.
    /// Corrupt copies are
    /// quarantined; they and stale primaries are then rewritten with the
    /// newest copy in the background.
    pub async fn read(&self, name: &str) -> RingResult<ReadOutcome> {
        let ring = self.ring.snapshot();
        let partition = ring.partition_for(name);
        let primaries = ring.primary_ids(partition);
        let quorum = self.config.read_quorum.size(primaries.len());
        let fanout = self
            .config
            .read_fanout
            .unwrap_or(primaries.len())
            .clamp(quorum.min(primaries.len()), primaries.len());
        let max_handoffs = self
            .config
            .max_handoffs_per_request
            .unwrap_or(primaries.len());
        let handoff_devices = ring.handoff_devices(partition);
        let mut candidates = primaries
            .iter()
            .copied()
            .chain(handoff_devices.iter().map(|d| d.id).take(max_handoffs))
            .filter(|id| !self.limiter.is_limited(*id));

        let pending = FuturesUnordered::new();
        for device in candidates.by_ref().take(fanout) {
            pending.push(self.get_from(device, partition, name));
        }

        let mut responses: Vec<(DeviceId, Option<ObjectRecord>)> = Vec::new();
        let mut corrupt: Vec<DeviceId> = Vec::new();
        let grace = self.config.post_quorum_timeout();
        let answered = gather(pending, quorum, grace, |(device, result), pending| {
            let failure = match result {
                Ok(Some(record)) => match record.verify() {
                    Ok(()) => {
                        responses.push((device, Some(record)));
                        return true;
                    }
                    Err(err) => {
                        warn!(device, partition, %err, "corrupt replica");
                        self.limiter.limit(device);
                        corrupt.push(device);
                        err
                    }
                },
                // A fallback's miss says nothing about the object.
                Ok(None) if !primaries.contains(&device) => {
                    responses.push((device, None));
                    if let Some(next) = candidates.next() {
                        pending.push(self.get_from(next, partition, name));
                    }
                    return false;
                }
                Ok(None) => {
                    responses.push((device, None));
                    return true;
                }
                Err(err) => {
                    self.limiter.increment(device);
                    err
                }
            };
            debug!(device, partition, err = %failure, "replica read failed");
            if let Some(next) = candidates.next() {
                pending.push(self.get_from(next, partition, name));
            }
            false
        })
        .await;

        if answered < quorum {
            warn!(name, partition, answered, quorum, "read quorum not met");
            return Err(RingError::QuorumNotMet {
                needed: quorum,
                got: answered,
            });
        }

        let policy = self.config.conflict_policy;
        let newest = responses
            .iter()
            .filter_map(|(_, record)| record.as_ref())
            .max_by(|a, b| {
                policy.compare((&a.version, a.tombstone), (&b.version, b.tombstone))
            })
            .cloned();

        let mut repairing = Vec::new();
        if let Some(newest) = &newest {
            let stale = responses.iter().filter(|(device, record)| {
                primaries.contains(device)
                    && record.as_ref().is_none_or(|r| {
                        policy.compare((&newest.version, newest.tombstone), (&r.version, r.tombstone))
                            == Ordering::Greater
                    })
            });
            repairing.extend(stale.map(|(device, _)| *device));
            repairing.extend(corrupt.iter().copied().filter(|d| primaries.contains(d)));
        }
        self.spawn_repair(partition, name, newest.clone(), corrupt, repairing.clone());

        Ok(ReadOutcome {
            partition,
            newest,
            responded: responses.into_iter().map(|(device, _)| device).collect(),
            repairing,
        })
    }

    /// Quarantines corrupt copies of `name`, then writes the good copy, if
    /// any, to every target.
    fn spawn_repair(
        &self,
        partition: Partition,
        name: &str,
        record: Option<ObjectRecord>,
        corrupt: Vec<DeviceId>,
        targets: Vec<DeviceId>,
    ) {
        if corrupt.is_empty() && targets.is_empty() {
            return;
        }
        let client = self.client.clone();
        let limit = self.config.node_timeout();
        let name = name.to_string();
        let mut repairs = self.repairs.lock();
        while repairs.try_join_next().is_some() {}
        repairs.spawn(async move {
            for device in corrupt {
                let call = client.quarantine(device, partition, &name);
                if let Err(err) = bounded(limit, call).await {
                    debug!(device, partition, %err, "quarantine request failed");
                }
            }
            let Some(record) = record else {
                return;
            };
            for device in targets {
                let call = client.put(device, partition, record.clone());
                match bounded(limit, call).await {
                    Ok(_) => debug!(device, partition, name = %record.name, "read repair"),
                    Err(err) => debug!(device, partition, %err, "read repair failed"),
                }
            }
        });
    }

    /// Waits for background repairs started so far.
    pub async fn settle(&self) {
        let mut repairs = std::mem::take(&mut *self.repairs.lock());
        while repairs.join_next().await.is_some() {}
    }
}
