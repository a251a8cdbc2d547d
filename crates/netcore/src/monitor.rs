//! Component K: a deadlock/stall watchdog for the I/O worker. A version
//! counter bumped once per completed poll pass; a watchdog holding the
//! last value it saw can tell whether the worker is still making
//! progress or is stuck in a single pass.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub(crate) struct Monitor {
    version: AtomicU64,
}

impl Monitor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Called by the worker once per completed poll pass.
    pub(crate) fn trigger(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

/// A cheap external watchdog: remembers the last version it saw and
/// reports whether the worker has made progress since.
pub struct Watchdog {
    monitor: std::sync::Arc<Monitor>,
    last_seen: u64,
}

impl Watchdog {
    pub(crate) fn new(monitor: std::sync::Arc<Monitor>) -> Self {
        let last_seen = monitor.version();
        Self { monitor, last_seen }
    }

    /// Returns `true` if the worker's poll version hasn't advanced since
    /// the last call — i.e. it's been stuck in a single pass (a slow
    /// handler callback, a wedged syscall) since then.
    pub fn check_and_advance(&mut self) -> bool {
        let now = self.monitor.version();
        let stuck = now == self.last_seen;
        self.last_seen = now;
        stuck
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn detects_lack_of_progress() {
        let monitor = Arc::new(Monitor::new());
        let mut watchdog = Watchdog::new(Arc::clone(&monitor));
        assert!(watchdog.check_and_advance(), "nothing triggered yet");
        monitor.trigger();
        assert!(!watchdog.check_and_advance());
        assert!(watchdog.check_and_advance(), "no trigger since last check");
    }
}
