//! Rolling time-window counter for throughput snapshots.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Counts events within a sliding time window.
///
/// Used for the runner's rolling throughput snapshot; read-only consumers
/// never sit on the scheduling path.
#[derive(Debug)]
pub struct RollingWindow {
    window_ms: u64,
    events: Mutex<VecDeque<u64>>,
}

impl RollingWindow {
    /// Create a window spanning `window_ms` milliseconds.
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one event at `now_ms`.
    pub fn record(&self, now_ms: u64) {
        let mut events = self.events.lock();
        events.push_back(now_ms);
        Self::prune(&mut events, self.window_ms, now_ms);
    }

    /// Events recorded within the window ending at `now_ms`.
    pub fn count(&self, now_ms: u64) -> usize {
        let mut events = self.events.lock();
        Self::prune(&mut events, self.window_ms, now_ms);
        events.len()
    }

    /// Events per second over the window ending at `now_ms`.
    pub fn per_second(&self, now_ms: u64) -> f64 {
        if self.window_ms == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.count(now_ms) as f64 * 1000.0 / self.window_ms as f64;
        rate
    }

    fn prune(events: &mut VecDeque<u64>, window_ms: u64, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while events.front().is_some_and(|t| *t < cutoff) {
            events.pop_front();
        }
    }
}
