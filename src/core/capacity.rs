//! Resource capacity accounting: atomic multi-resource acquisition,
//! hierarchical quota chains, and timer-replenished quota pools.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::error::SchedulerError;

/// Named resource quantities, interpreted as "all of these must be available
/// simultaneously".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCost(BTreeMap<String, u64>);

impl ResourceCost {
    /// Empty cost (always affordable).
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion of one resource quantity.
    #[must_use]
    pub fn with(mut self, resource: impl Into<String>, units: u64) -> Self {
        self.0.insert(resource.into(), units);
        self
    }

    /// Units required for `resource`; zero if absent.
    pub fn get(&self, resource: &str) -> u64 {
        self.0.get(resource).copied().unwrap_or(0)
    }

    /// Whether no resources are named.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(resource, units)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, u64)> for ResourceCost {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Result of an atomic check-then-acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Every resource was reserved.
    Accepted,
    /// Nothing was reserved; `shortfall` holds the missing units per
    /// resource, for metrics.
    Rejected {
        /// Units missing per resource at rejection time.
        shortfall: ResourceCost,
    },
}

impl AcquireOutcome {
    /// Whether the acquisition was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Read-only snapshot of acquisition counters and utilization.
#[derive(Debug, Clone, Default)]
pub struct CapacityStats {
    /// Accepted acquisitions.
    pub accepted: u64,
    /// Rejected acquisitions.
    pub rejected: u64,
    /// Used fraction per resource (`(limit - available) / limit`).
    pub utilization: BTreeMap<String, f64>,
}

/// Seam between the runner and whatever backs capacity.
///
/// Implementations must make `try_acquire` atomic: either every resource in
/// the cost is reserved or none is.
pub trait CapacitySource: Send + Sync {
    /// Pure predicate: true iff the cost is currently affordable here and in
    /// every ancestor.
    fn can_acquire(&self, cost: &ResourceCost) -> bool;

    /// Reserve the cost. Must follow a successful
    /// [`can_acquire`](CapacitySource::can_acquire) in the same synchronous
    /// turn; errors with [`SchedulerError::CapacityExceeded`] rather than
    /// going negative.
    fn acquire_immediate(&self, cost: &ResourceCost) -> Result<(), SchedulerError>;

    /// Return the cost to the pool, capped at the limits.
    fn release(&self, cost: &ResourceCost);

    /// Atomic check-then-acquire, distinguishing acceptance from rejection.
    fn try_acquire(&self, cost: &ResourceCost) -> AcquireOutcome;

    /// Snapshot of currently available units.
    fn available(&self) -> ResourceCost;

    /// Snapshot of configured limits.
    fn limits(&self) -> ResourceCost;

    /// Wait condition: the receiver observes a new epoch whenever capacity
    /// may have freed up, so blocked callers can re-check.
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Acquisition counters and utilization. Off the control path.
    fn stats(&self) -> CapacityStats;
}

#[derive(Debug)]
struct CapacityState {
    limits: ResourceCost,
    available: ResourceCost,
}

/// Reusable capacity pool over named resource limits.
///
/// Resources absent from `limits` are untracked and impose no constraint, so
/// a child pool may constrain a subset of what its parent tracks. Invariant:
/// `0 <= available[r] <= limits[r]` for every tracked resource, at all times.
#[derive(Debug)]
pub struct ResourceCapacity {
    state: Mutex<CapacityState>,
    parent: Option<Arc<ResourceCapacity>>,
    epoch_tx: watch::Sender<u64>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl ResourceCapacity {
    /// Create a pool with the given limits, fully available.
    pub fn new(limits: ResourceCost) -> Self {
        Self::build(limits, None)
    }

    /// Create a pool whose acquisitions must also fit within `parent`.
    ///
    /// Acquisition reserves the parent first and rolls it back if this pool
    /// rejects; release propagates upward.
    pub fn with_parent(limits: ResourceCost, parent: Arc<ResourceCapacity>) -> Self {
        Self::build(limits, Some(parent))
    }

    fn build(limits: ResourceCost, parent: Option<Arc<ResourceCapacity>>) -> Self {
        let (epoch_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(CapacityState {
                available: limits.clone(),
                limits,
            }),
            parent,
            epoch_tx,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Replace the limits at runtime.
    ///
    /// Current usage is preserved: for each tracked resource,
    /// `available = new_limit - used`, clamped at zero. Usage above a
    /// shrunken limit is tolerated until naturally released.
    pub fn set_limits(&self, new_limits: ResourceCost) {
        {
            let mut state = self.state.lock();
            let mut available = BTreeMap::new();
            for (resource, new_limit) in new_limits.iter() {
                let old_limit = state.limits.get(resource);
                let used = old_limit.saturating_sub(state.available.get(resource));
                available.insert(resource.to_string(), new_limit.saturating_sub(used));
            }
            state.available = ResourceCost(available);
            state.limits = new_limits;
        }
        info!("capacity limits rebalanced");
        self.signal();
    }

    /// Quota replenishment: restore every tracked resource to its limit.
    pub(crate) fn refill_to_limits(&self) {
        {
            let mut state = self.state.lock();
            state.available = state.limits.clone();
        }
        debug!("quota reset to limits");
        self.signal();
    }

    /// Quota replenishment: add `delta` per tracked resource, capped at the
    /// limits.
    pub(crate) fn refill_by(&self, delta: &ResourceCost) {
        {
            let mut state = self.state.lock();
            for (resource, units) in delta.iter() {
                let limit = state.limits.get(resource);
                let have = state.available.get(resource);
                state
                    .available
                    .0
                    .insert(resource.to_string(), (have + units).min(limit));
            }
        }
        debug!("quota incremented");
        self.signal();
    }

    fn signal(&self) {
        self.epoch_tx.send_modify(|epoch| *epoch += 1);
    }

    /// Deduct the cost from tracked resources, or report the shortfall
    /// without changing anything.
    fn deduct(&self, cost: &ResourceCost) -> Result<(), ResourceCost> {
        let mut state = self.state.lock();
        let mut shortfall = BTreeMap::new();
        for (resource, units) in cost.iter() {
            // Untracked resources impose no constraint here.
            if state.limits.0.contains_key(resource) {
                let have = state.available.get(resource);
                if have < units {
                    shortfall.insert(resource.to_string(), units - have);
                }
            }
        }
        if !shortfall.is_empty() {
            return Err(ResourceCost(shortfall));
        }
        for (resource, units) in cost.iter() {
            if state.limits.0.contains_key(resource) {
                let have = state.available.get(resource);
                state.available.0.insert(resource.to_string(), have - units);
            }
        }
        Ok(())
    }

    fn restore(&self, cost: &ResourceCost) {
        let mut state = self.state.lock();
        for (resource, units) in cost.iter() {
            if state.limits.0.contains_key(resource) {
                let limit = state.limits.get(resource);
                let have = state.available.get(resource);
                state
                    .available
                    .0
                    .insert(resource.to_string(), (have + units).min(limit));
            }
        }
    }

    fn try_acquire_inner(&self, cost: &ResourceCost) -> AcquireOutcome {
        if let Some(parent) = &self.parent {
            match parent.try_acquire(cost) {
                AcquireOutcome::Accepted => {}
                rejected @ AcquireOutcome::Rejected { .. } => return rejected,
            }
        }
        match self.deduct(cost) {
            Ok(()) => AcquireOutcome::Accepted,
            Err(shortfall) => {
                // Roll the parent reservation back so the pair stays atomic.
                if let Some(parent) = &self.parent {
                    parent.release(cost);
                }
                AcquireOutcome::Rejected { shortfall }
            }
        }
    }
}

impl CapacitySource for ResourceCapacity {
    fn can_acquire(&self, cost: &ResourceCost) -> bool {
        let affordable_here = {
            let state = self.state.lock();
            cost.iter().all(|(resource, units)| {
                !state.limits.0.contains_key(resource) || state.available.get(resource) >= units
            })
        };
        affordable_here
            && self
                .parent
                .as_ref()
                .is_none_or(|parent| parent.can_acquire(cost))
    }

    fn acquire_immediate(&self, cost: &ResourceCost) -> Result<(), SchedulerError> {
        match self.try_acquire(cost) {
            AcquireOutcome::Accepted => Ok(()),
            AcquireOutcome::Rejected { shortfall } => {
                warn!(?shortfall, "acquire_immediate without sufficient capacity");
                Err(SchedulerError::CapacityExceeded)
            }
        }
    }

    fn release(&self, cost: &ResourceCost) {
        self.restore(cost);
        if let Some(parent) = &self.parent {
            parent.release(cost);
        }
        self.signal();
    }

    fn try_acquire(&self, cost: &ResourceCost) -> AcquireOutcome {
        let outcome = self.try_acquire_inner(cost);
        match &outcome {
            AcquireOutcome::Accepted => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
            }
            AcquireOutcome::Rejected { shortfall } => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(?shortfall, "acquisition rejected");
            }
        }
        outcome
    }

    fn available(&self) -> ResourceCost {
        self.state.lock().available.clone()
    }

    fn limits(&self) -> ResourceCost {
        self.state.lock().limits.clone()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    fn stats(&self) -> CapacityStats {
        let state = self.state.lock();
        let mut utilization = BTreeMap::new();
        for (resource, limit) in state.limits.iter() {
            #[allow(clippy::cast_precision_loss)]
            let used_fraction = if limit == 0 {
                0.0
            } else {
                (limit - state.available.get(resource).min(limit)) as f64 / limit as f64
            };
            utilization.insert(resource.to_string(), used_fraction);
        }
        CapacityStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            utilization,
        }
    }
}

/// Capacity pool whose consumption is not restored on task completion.
///
/// `release` is a no-op; capacity is replenished only by a running timer.
/// Models rate limits and token buckets rather than reusable capacity.
#[derive(Debug)]
pub struct QuotaCapacity {
    inner: Arc<ResourceCapacity>,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl QuotaCapacity {
    /// Create a quota pool with the given limits, fully available.
    pub fn new(limits: ResourceCost) -> Self {
        Self {
            inner: Arc::new(ResourceCapacity::new(limits)),
            timer: Mutex::new(None),
        }
    }

    /// Create a quota pool whose acquisitions must also fit within `parent`.
    pub fn with_parent(limits: ResourceCost, parent: Arc<ResourceCapacity>) -> Self {
        Self {
            inner: Arc::new(ResourceCapacity::with_parent(limits, parent)),
            timer: Mutex::new(None),
        }
    }

    /// Every `interval`, set `available = limits` (once per tick, not
    /// cumulatively) and signal the wait condition.
    ///
    /// Replaces any running timer. Must be called within a tokio runtime.
    pub fn start_periodic_reset(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        self.replace_timer(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                inner.refill_to_limits();
            }
        }));
    }

    /// Every `interval`, add `delta` to `available` (capped at the limits)
    /// and signal the wait condition.
    ///
    /// Replaces any running timer. Must be called within a tokio runtime.
    pub fn start_periodic_increment(&self, interval: Duration, delta: ResourceCost) {
        let inner = Arc::clone(&self.inner);
        self.replace_timer(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                inner.refill_by(&delta);
            }
        }));
    }

    /// Cancel the replenishment timer, if running.
    pub fn stop_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    fn replace_timer(&self, handle: tokio::task::JoinHandle<()>) {
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for QuotaCapacity {
    fn drop(&mut self) {
        self.stop_timer();
    }
}

impl CapacitySource for QuotaCapacity {
    fn can_acquire(&self, cost: &ResourceCost) -> bool {
        self.inner.can_acquire(cost)
    }

    fn acquire_immediate(&self, cost: &ResourceCost) -> Result<(), SchedulerError> {
        self.inner.acquire_immediate(cost)
    }

    /// No-op: consumed quota is restored only by the replenishment timer.
    fn release(&self, _cost: &ResourceCost) {}

    fn try_acquire(&self, cost: &ResourceCost) -> AcquireOutcome {
        self.inner.try_acquire(cost)
    }

    fn available(&self) -> ResourceCost {
        self.inner.available()
    }

    fn limits(&self) -> ResourceCost {
        self.inner.limits()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.subscribe()
    }

    fn stats(&self) -> CapacityStats {
        self.inner.stats()
    }
}
