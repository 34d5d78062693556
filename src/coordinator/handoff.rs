use {
    crate::{device::DeviceId, hash::Partition, timestamp::Timestamp},
    parking_lot::Mutex,
    serde::{Deserialize, Serialize},
};

/// Record of a write that landed on a fallback device because a primary
/// could not take it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandoffEntry {
    pub partition: Partition,
    /// Primary the data belongs on.
    pub intended: DeviceId,
    /// Device that holds it meanwhile.
    pub actual: DeviceId,
    pub name: String,
    pub timestamp: Timestamp,
}

/// Pending handoff entries, shared by coordinators (which record them) and
/// replicators (which push the data home and purge them).
#[derive(Debug, Default)]
pub struct HandoffLog {
    entries: Mutex<Vec<HandoffEntry>>,
}

impl HandoffLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: HandoffEntry) {
        let mut entries = self.entries.lock();
        if !entries.contains(&entry) {
            entries.push(entry);
        }
    }

    /// Entries whose data sits on the given device.
    pub fn held_by(&self, device: DeviceId) -> Vec<HandoffEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.actual == device)
            .cloned()
            .collect()
    }

    /// Removes an entry once its data reached the intended device.
    pub fn complete(&self, entry: &HandoffEntry) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e != entry);
        entries.len() < before
    }

    pub fn entries(&self) -> Vec<HandoffEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
