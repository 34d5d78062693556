use {
    super::{BulkTransfer, ReplicaClient, TransferOutcome, TransferRequest},
    crate::{
        RingError,
        RingResult,
        device::DeviceId,
        hash::Partition,
        replicator::{Fingerprint, bucket_of},
        store::{MemoryStore, ObjectMeta, ObjectRecord, ObjectStore},
        timestamp::ConflictPolicy,
    },
    async_trait::async_trait,
    parking_lot::RwLock,
    std::{
        collections::{HashMap, HashSet},
        sync::Arc,
        time::Duration,
    },
};

/// In-process cluster: one [`MemoryStore`] per device, with switches to make
/// devices unreachable or slow.
#[derive(Debug, Default)]
pub struct LocalCluster {
    policy: ConflictPolicy,
    stores: RwLock<HashMap<DeviceId, Arc<MemoryStore>>>,
    down: RwLock<HashSet<DeviceId>>,
    latency: RwLock<HashMap<DeviceId, Duration>>,
}

impl LocalCluster {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Store of the device, created on first use.
    pub fn add_device(&self, id: DeviceId) -> Arc<MemoryStore> {
        self.stores
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(MemoryStore::with_policy(self.policy)))
            .clone()
    }

    pub fn store(&self, id: DeviceId) -> Option<Arc<MemoryStore>> {
        self.stores.read().get(&id).cloned()
    }

    pub fn set_reachable(&self, id: DeviceId, reachable: bool) {
        let mut down = self.down.write();
        if reachable {
            down.remove(&id);
        } else {
            down.insert(id);
        }
    }

    /// Delays every client call to the device.
    pub fn set_latency(&self, id: DeviceId, latency: Duration) {
        self.latency.write().insert(id, latency);
    }

    fn reach(&self, id: DeviceId) -> RingResult<Arc<MemoryStore>> {
        if self.down.read().contains(&id) {
            return Err(RingError::unreachable(id, "device down"));
        }
        self.store(id)
            .ok_or_else(|| RingError::unreachable(id, "no such device"))
    }

    async fn connect(&self, id: DeviceId) -> RingResult<Arc<MemoryStore>> {
        let latency = self.latency.read().get(&id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.reach(id)
    }
}

#[async_trait]
impl ReplicaClient for LocalCluster {
    async fn put(
        &self,
        device: DeviceId,
        partition: Partition,
        record: ObjectRecord,
    ) -> RingResult<bool> {
        self.connect(device).await?.put(partition, record)
    }

    async fn get(
        &self,
        device: DeviceId,
        partition: Partition,
        name: &str,
    ) -> RingResult<Option<ObjectRecord>> {
        self.connect(device).await?.get(partition, name)
    }

    async fn fingerprint(
        &self,
        device: DeviceId,
        partition: Partition,
        buckets: u16,
    ) -> RingResult<Fingerprint> {
        let metas = self.connect(device).await?.list(partition)?;
        Ok(Fingerprint::of(&metas, buckets))
    }

    async fn manifest(
        &self,
        device: DeviceId,
        partition: Partition,
        buckets: &[u16],
        bucket_count: u16,
    ) -> RingResult<Vec<ObjectMeta>> {
        let metas = self.connect(device).await?.list(partition)?;
        Ok(metas
            .into_iter()
            .filter(|m| buckets.contains(&bucket_of(&m.name, bucket_count)))
            .collect())
    }

    async fn quarantine(
        &self,
        device: DeviceId,
        partition: Partition,
        name: &str,
    ) -> RingResult<()> {
        self.connect(device).await?.quarantine(partition, name)
    }
}

impl BulkTransfer for LocalCluster {
    fn transfer(&self, request: &TransferRequest) -> RingResult<TransferOutcome> {
        let source = self.reach(request.source)?;
        let target = self.reach(request.target)?;

        let mut outcome = TransferOutcome::default();
        for name in &request.names {
            let copied = source.get(request.partition, name).and_then(|record| match record {
                Some(record) => target.put(request.partition, record).map(|_| ()),
                None => Err(RingError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "missing at source",
                ))),
            });
            match copied {
                Ok(()) => outcome.transferred.push(name.clone()),
                Err(err) => outcome.failed.push((name.clone(), err.to_string())),
            }
        }
        Ok(outcome)
    }
}
