use crate::device::DeviceId;

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// Ring failed self-consistency validation and must not be served.
    #[error("Corrupt ring: {0}")]
    CorruptRing(String),

    /// Placement constraints cannot be met with the current device table.
    ///
    /// Cluster state is left unchanged.
    #[error(
        "Infeasible placement: {replicas} replicas over {devices} assignable devices in {zones} zones"
    )]
    InfeasiblePlacement {
        replicas: usize,
        devices: usize,
        zones: usize,
    },

    /// A replica device could not be reached.
    #[error("Replica {device} unreachable: {reason}")]
    ReplicaUnreachable { device: DeviceId, reason: String },

    /// Not enough replicas answered for the operation to succeed.
    #[error("Quorum not met: need {needed}, got {got}")]
    QuorumNotMet { needed: usize, got: usize },

    /// Stored object content does not match its recorded checksum.
    #[error("Checksum mismatch for {name}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("Device already present at {0}")]
    DuplicateDevice(String),

    /// No more device ids available in the device table.
    #[error("Out of device ids")]
    OutOfDeviceIds,

    #[error("Invalid partition power: {0}")]
    InvalidPartPower(u8),

    #[error("Invalid replica count: {0}")]
    InvalidReplicaCount(usize),

    /// Another rebalance holds the device table.
    #[error("Rebalance already in progress")]
    RebalanceInProgress,

    /// Attempt to install a ring that is not newer than the served one.
    #[error("Stale ring version {offered}, serving {current}")]
    StaleRing { offered: u64, current: u64 },

    #[error("Operation timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RingError {
    /// Whether the failure is local to one replica and worth retrying later
    /// (through handoff or backoff) rather than surfacing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ReplicaUnreachable { .. } | Self::Timeout)
    }

    pub(crate) fn unreachable(device: DeviceId, reason: impl Into<String>) -> Self {
        Self::ReplicaUnreachable {
            device,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for RingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for RingError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for RingError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type RingResult<T> = Result<T, RingError>;
