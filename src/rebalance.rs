//! Operator-facing rebalance.
//!
//! A topology change is a pure function from the deployed ring and a list of
//! device edits to the next ring and its move diff ([`plan`]).
//! [`RebalanceCommand`] wraps the same computation around the live builder
//! and ring handle, serializing operators so that two rebalances never run
//! at once.

use {
    crate::{
        RingError,
        RingResult,
        builder::{Dispersion, Rebalance, RingBuilder, RingDiff},
        config::BuilderConfig,
        device::{DeviceId, DeviceSpec},
        ring::{Ring, RingHandle},
    },
    parking_lot::{Mutex, MutexGuard},
    serde::{Deserialize, Serialize},
    std::{fmt, sync::Arc},
    tracing::{info, warn},
};

/// Single edit of the device table or replica count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyChange {
    Add(DeviceSpec),
    SetWeight { device: DeviceId, weight: f64 },
    Drain(DeviceId),
    Remove(DeviceId),
    Activate(DeviceId),
    SetReplicas(usize),
}

impl TopologyChange {
    fn apply(self, builder: &mut RingBuilder) -> RingResult<()> {
        match self {
            Self::Add(spec) => builder.add_device(spec).map(|_| ()),
            Self::SetWeight { device, weight } => builder.set_weight(device, weight),
            Self::Drain(device) => builder.drain(device),
            Self::Remove(device) => builder.remove_device(device),
            Self::Activate(device) => builder.activate(device),
            Self::SetReplicas(replicas) => builder.set_replicas(replicas),
        }
    }
}

/// Computes the ring that follows `old` once `changes` are applied.
///
/// Neither `old` nor any shared state is touched.
pub fn plan(
    old: &Ring,
    changes: impl IntoIterator<Item = TopologyChange>,
    config: &BuilderConfig,
    dispersion: Dispersion,
) -> RingResult<Rebalance> {
    let mut builder = RingBuilder::from_ring(old, config)?;
    for change in changes {
        change.apply(&mut builder)?;
    }
    builder.rebalance_with(dispersion)
}

/// What a committed rebalance did.
#[derive(Debug, Clone)]
pub struct RebalanceSummary {
    pub version: u64,
    pub moved_replicas: usize,
    pub moved_partitions: usize,
    pub balance: f64,
    pub dispersion: f64,
    pub diff: RingDiff,
}

impl RebalanceSummary {
    /// Summary of `rebalance`, given the dispersion its builder now reports.
    pub fn new(rebalance: &Rebalance, dispersion: f64) -> Self {
        Self {
            version: rebalance.ring.version(),
            moved_replicas: rebalance.diff.moved_replicas(),
            moved_partitions: rebalance.diff.moved_partitions(),
            balance: rebalance.balance,
            dispersion,
            diff: rebalance.diff.clone(),
        }
    }
}

impl fmt::Display for RebalanceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ring v{}: {} replicas moved across {} partitions, balance {:.2}%, dispersion {:.2}%",
            self.version, self.moved_replicas, self.moved_partitions, self.balance, self.dispersion
        )
    }
}

/// Serialized access to the live builder.
pub struct RebalanceCommand {
    builder: Mutex<RingBuilder>,
    handle: Arc<RingHandle>,
}

impl RebalanceCommand {
    pub fn new(builder: RingBuilder, handle: Arc<RingHandle>) -> Self {
        Self {
            builder: Mutex::new(builder),
            handle,
        }
    }

    /// Command over the ring currently served by `handle`.
    pub fn from_handle(handle: Arc<RingHandle>, config: &BuilderConfig) -> RingResult<Self> {
        let builder = RingBuilder::from_ring(&handle.snapshot(), config)?;
        Ok(Self::new(builder, handle))
    }

    /// Copy of the committed builder state.
    pub fn builder(&self) -> RingBuilder {
        self.builder.lock().clone()
    }

    /// Takes exclusive hold of the builder.
    ///
    /// Fails with [`RingError::RebalanceInProgress`] while another session is
    /// open.
    pub fn begin(&self) -> RingResult<RebalanceSession<'_>> {
        let guard = self.builder.try_lock().ok_or(RingError::RebalanceInProgress)?;
        let staged = guard.clone();
        Ok(RebalanceSession {
            guard,
            staged,
            handle: &self.handle,
        })
    }

    /// Applies `changes`, rebalances and swaps the new ring in.
    pub fn apply(
        &self,
        changes: impl IntoIterator<Item = TopologyChange>,
        dispersion: Dispersion,
    ) -> RingResult<RebalanceSummary> {
        let mut session = self.begin()?;
        for change in changes {
            session.stage(change)?;
        }
        session.commit(dispersion)
    }
}

/// Open rebalance; changes are staged on a copy of the builder and only
/// become visible on [`commit`](Self::commit). Dropping the session discards
/// them.
pub struct RebalanceSession<'a> {
    guard: MutexGuard<'a, RingBuilder>,
    staged: RingBuilder,
    handle: &'a RingHandle,
}

impl RebalanceSession<'_> {
    pub fn stage(&mut self, change: TopologyChange) -> RingResult<()> {
        change.apply(&mut self.staged)
    }

    pub fn staged(&self) -> &RingBuilder {
        &self.staged
    }

    /// Rebalances the staged builder and installs the resulting ring.
    ///
    /// On any failure the committed builder and the served ring stay as
    /// they were.
    pub fn commit(mut self, dispersion: Dispersion) -> RingResult<RebalanceSummary> {
        let rebalance = match self.staged.rebalance_with(dispersion) {
            Ok(rebalance) => rebalance,
            Err(err) => {
                warn!(%err, "rebalance rejected");
                return Err(err);
            }
        };
        let summary = RebalanceSummary::new(&rebalance, self.staged.dispersion());
        self.handle.swap(rebalance.ring)?;

        *self.guard = self.staged;
        info!(
            version = summary.version,
            moved = summary.moved_replicas,
            partitions = summary.moved_partitions,
            "rebalance committed"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::device::DeviceState};

    fn deployed() -> (RingBuilder, Ring) {
        let config = BuilderConfig {
            part_power: 6,
            ..BuilderConfig::default()
        };
        let mut builder = RingBuilder::new(&config).unwrap();
        for zone in 0..4 {
            builder
                .add_device(DeviceSpec::new(format!("10.0.0.{zone}:6200"), "sdb", 100.0).zone(zone))
                .unwrap();
        }
        let ring = builder.rebalance().unwrap().ring;
        (builder, ring)
    }

    #[test]
    fn plan_is_pure() {
        let (_, ring) = deployed();
        let before = ring.to_data();

        let rebalance = plan(
            &ring,
            [TopologyChange::Remove(3)],
            &BuilderConfig::default(),
            Dispersion::Strict,
        )
        .unwrap();
        assert_eq!(ring.to_data(), before);
        assert_eq!(rebalance.ring.version(), ring.version() + 1);
        assert_eq!(rebalance.diff.moved_replicas(), ring.partitions_for_device(3).len());
        assert!(rebalance.diff.moves().iter().all(|m| m.from == Some(3)));

        // Same input, same output.
        let again = plan(
            &ring,
            [TopologyChange::Remove(3)],
            &BuilderConfig::default(),
            Dispersion::Strict,
        )
        .unwrap();
        assert_eq!(again.ring.to_data(), rebalance.ring.to_data());
        assert_eq!(again.diff, rebalance.diff);

        assert!(matches!(
            plan(&ring, [TopologyChange::Drain(42)], &BuilderConfig::default(), Dispersion::Strict),
            Err(RingError::UnknownDevice(42))
        ));
    }

    #[test]
    fn command_swaps_ring() {
        let (builder, ring) = deployed();
        let handle = Arc::new(RingHandle::new(ring));
        let command = RebalanceCommand::new(builder, handle.clone());

        let summary = command
            .apply(
                [
                    TopologyChange::Add(DeviceSpec::new("10.0.0.4:6200", "sdb", 100.0).zone(4)),
                    TopologyChange::SetWeight { device: 0, weight: 50.0 },
                ],
                Dispersion::Strict,
            )
            .unwrap();
        assert_eq!(summary.version, 2);
        assert!(summary.moved_replicas > 0);
        assert_eq!(summary.moved_replicas, summary.diff.moved_replicas());
        assert!(summary.to_string().starts_with("ring v2:"));

        assert_eq!(handle.version(), 2);
        assert!(!handle.snapshot().partitions_for_device(4).is_empty());
        assert_eq!(command.builder().version(), 2);
        assert_eq!(command.builder().devices().len(), 5);
    }

    #[test]
    fn rejected_rebalance_changes_nothing() {
        let (builder, ring) = deployed();
        let handle = Arc::new(RingHandle::new(ring));
        let command = RebalanceCommand::new(builder, handle.clone());

        let err = command
            .apply(
                [TopologyChange::Remove(0), TopologyChange::Remove(1)],
                Dispersion::Strict,
            )
            .unwrap_err();
        assert!(matches!(err, RingError::InfeasiblePlacement { zones: 2, .. }));
        assert_eq!(handle.version(), 1);
        assert!(
            command
                .builder()
                .devices()
                .iter()
                .all(|d| d.state == DeviceState::Active)
        );
    }

    #[test]
    fn one_session_at_a_time() {
        let (_, ring) = deployed();
        let handle = Arc::new(RingHandle::new(ring));
        let command = RebalanceCommand::from_handle(handle.clone(), &BuilderConfig::default()).unwrap();

        let mut session = command.begin().unwrap();
        session.stage(TopologyChange::Drain(2)).unwrap();
        assert!(matches!(command.begin(), Err(RingError::RebalanceInProgress)));
        drop(session);

        // Dropped without commit: the staged drain is gone.
        let session = command.begin().unwrap();
        assert_eq!(session.staged().devices()[2].state, DeviceState::Active);
        let summary = session.commit(Dispersion::Strict).unwrap();
        assert!(summary.diff.is_empty());
        assert_eq!(handle.version(), 2);
    }
}
