//! Boundary with remote devices.
//!
//! [`ReplicaClient`] carries per-object requests from coordinators and
//! replicators to a device; [`BulkTransfer`] is the blocking file-set copy
//! primitive the replicator drives for repairs.

pub mod local;

use {
    crate::{
        RingResult,
        device::DeviceId,
        hash::Partition,
        replicator::{Fingerprint, JobKind},
        store::{ObjectMeta, ObjectRecord},
    },
    async_trait::async_trait,
    auto_impl::auto_impl,
    serde::{Deserialize, Serialize},
};

pub use local::LocalCluster;

/// Requests served by a device.
///
/// Implementations report a device they cannot reach with
/// [`RingError::ReplicaUnreachable`](crate::RingError::ReplicaUnreachable).
/// Callers bound every call with their own timeout.
#[async_trait]
pub trait ReplicaClient: Send + Sync {
    /// Stores a record. Returns `false` when the device already held an equal
    /// or newer version.
    async fn put(&self, device: DeviceId, partition: Partition, record: ObjectRecord)
    -> RingResult<bool>;

    async fn get(
        &self,
        device: DeviceId,
        partition: Partition,
        name: &str,
    ) -> RingResult<Option<ObjectRecord>>;

    async fn fingerprint(
        &self,
        device: DeviceId,
        partition: Partition,
        buckets: u16,
    ) -> RingResult<Fingerprint>;

    /// Listing of the objects falling into the given fingerprint buckets.
    async fn manifest(
        &self,
        device: DeviceId,
        partition: Partition,
        buckets: &[u16],
        bucket_count: u16,
    ) -> RingResult<Vec<ObjectMeta>>;

    async fn quarantine(&self, device: DeviceId, partition: Partition, name: &str)
    -> RingResult<()>;
}

/// Set of objects of one partition to copy between devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub partition: Partition,
    pub source: DeviceId,
    pub target: DeviceId,
    /// Whether `names` is the whole partition or only what differs.
    pub kind: JobKind,
    pub names: Vec<String>,
}

/// Per-object result of a transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub transferred: Vec<String>,
    /// Name and reason of every object that could not be copied.
    pub failed: Vec<(String, String)>,
}

impl TransferOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Blocking bulk copy.
///
/// An `Err` means nothing was attempted (for example an endpoint is down);
/// otherwise the outcome tells per object what succeeded.
#[auto_impl(&, Arc, Box)]
pub trait BulkTransfer: Send + Sync {
    fn transfer(&self, request: &TransferRequest) -> RingResult<TransferOutcome>;
}
