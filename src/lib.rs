//! Partition ring, placement builder and quorum replication for object
//! storage clusters.
//!
//! Keys hash to one of a fixed, power-of-two number of partitions. A
//! [`Ring`] maps every partition to an ordered list of devices, computed by
//! the [`RingBuilder`] from a weighted, zoned [`DeviceTable`](device::DeviceTable).
//! The [`Coordinator`] fans requests out to a partition's devices and decides
//! success by quorum, while each device's [`Replicator`] reconciles replicas
//! in the background.

pub mod builder;
pub mod config;
pub mod coordinator;
pub mod device;
mod error;
pub mod hash;
pub mod rebalance;
pub mod replicator;
pub mod ring;
pub mod store;
pub mod timestamp;
pub mod transport;

pub use {
    builder::{Dispersion, Rebalance, RingBuilder, RingDiff},
    config::Config,
    coordinator::{Coordinator, ReadOutcome, WriteOutcome},
    device::{Device, DeviceId, DeviceSpec, DeviceState},
    error::{RingError, RingResult},
    hash::Partition,
    rebalance::{RebalanceCommand, RebalanceSummary, TopologyChange},
    replicator::{Replicator, SyncLagReport},
    ring::{Ring, RingHandle},
    timestamp::{Timestamp, Version},
};
