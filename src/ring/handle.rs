use {
    super::Ring,
    crate::{RingError, RingResult},
    parking_lot::RwLock,
    std::sync::Arc,
    tracing::info,
};

/// Shared, swappable reference to the ring in service.
///
/// Readers take a snapshot and keep using it for the whole operation; a swap
/// installs a new version without affecting snapshots already taken.
#[derive(Debug)]
pub struct RingHandle {
    current: RwLock<Arc<Ring>>,
}

impl RingHandle {
    pub fn new(ring: Ring) -> Self {
        Self {
            current: RwLock::new(Arc::new(ring)),
        }
    }

    /// Ring currently in service.
    pub fn snapshot(&self) -> Arc<Ring> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version()
    }

    /// Installs a newer ring, returning the one it replaces.
    pub fn swap(&self, ring: Ring) -> RingResult<Arc<Ring>> {
        let mut current = self.current.write();
        if ring.version() <= current.version() {
            return Err(RingError::StaleRing {
                offered: ring.version(),
                current: current.version(),
            });
        }
        info!(from = current.version(), to = ring.version(), "ring swapped");
        Ok(std::mem::replace(&mut *current, Arc::new(ring)))
    }
}
