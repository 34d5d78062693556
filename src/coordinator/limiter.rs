use {
    crate::device::DeviceId,
    parking_lot::Mutex,
    std::{collections::HashMap, time::Duration},
    tokio::time::Instant,
    tracing::warn,
};

#[derive(Debug, Clone, Copy)]
struct ErrorState {
    errors: u32,
    last_error: Instant,
}

/// Tracks per-device errors and suppresses devices that fail too often.
///
/// A device with more than `limit` errors, the last of which happened less
/// than `interval` ago, is skipped. Counts reset once a device stays quiet
/// for `interval`.
#[derive(Debug)]
pub struct ErrorLimiter {
    limit: u32,
    interval: Duration,
    states: Mutex<HashMap<DeviceId, ErrorState>>,
}

impl ErrorLimiter {
    pub fn new(limit: u32, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether requests to the device should currently be skipped.
    pub fn is_limited(&self, device: DeviceId) -> bool {
        let mut states = self.states.lock();
        let Some(state) = states.get(&device).copied() else {
            return false;
        };
        if state.last_error.elapsed() >= self.interval {
            states.remove(&device);
            return false;
        }
        state.errors > self.limit
    }

    /// Records one error.
    pub fn increment(&self, device: DeviceId) {
        let now = Instant::now();
        let mut states = self.states.lock();
        let state = states.entry(device).or_insert(ErrorState {
            errors: 0,
            last_error: now,
        });
        if now.duration_since(state.last_error) >= self.interval {
            state.errors = 0;
        }
        state.errors += 1;
        state.last_error = now;
        if state.errors == self.limit + 1 {
            warn!(device, errors = state.errors, "device error limited");
        }
    }

    /// Suppresses the device right away.
    pub fn limit(&self, device: DeviceId) {
        let mut states = self.states.lock();
        states.insert(
            device,
            ErrorState {
                errors: self.limit + 1,
                last_error: Instant::now(),
            },
        );
        warn!(device, "device error limited");
    }

    pub fn errors(&self, device: DeviceId) -> u32 {
        self.states.lock().get(&device).map_or(0, |s| s.errors)
    }
}
