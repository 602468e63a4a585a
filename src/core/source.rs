//! Task sources: priority ordering with aging, optionally gated by a
//! dependency graph.
//!
//! Effective priority is time-varying (base plus a bounded aging boost), and
//! graph-driven readiness changes independently of enqueue order, so
//! selection re-scans entries instead of keeping a plain heap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::core::capacity::ResourceCost;
use crate::core::error::SchedulerError;
use crate::core::graph::{DependencyGraph, TaskState};
use crate::core::task::{ScheduledTask, TaskId};
use crate::util::clock::Clock;

/// Starvation-resistance parameters: waiting entries gain
/// `rate_per_ms * waited_ms` priority, capped at `max_boost`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgingPolicy {
    /// Priority gained per millisecond of waiting.
    pub rate_per_ms: f64,
    /// Upper bound on the aging boost.
    pub max_boost: f64,
}

impl AgingPolicy {
    /// No aging: effective priority equals base priority.
    pub const NONE: Self = Self {
        rate_per_ms: 0.0,
        max_boost: 0.0,
    };

    /// Boost earned after waiting `waited_ms`.
    pub fn boost(&self, waited_ms: u64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let earned = self.rate_per_ms * waited_ms as f64;
        earned.min(self.max_boost)
    }
}

impl Default for AgingPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

/// Cheap snapshot of the entry `next()` would consume.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub id: TaskId,
    /// Resource cost of the task.
    pub cost: ResourceCost,
    /// Effective (aging-boosted) priority at snapshot time.
    pub effective_priority: f64,
}

/// Abstraction for something the runner can peek and drain in priority
/// order, with lifecycle callbacks feeding back into it.
///
/// `complete` and `fail` return `Ok(false)` when the outcome is stale: the
/// task was aborted while running and its result must be discarded.
pub trait TaskSource<P>: Send + Sync {
    /// Snapshot the entry `next()` would return, without consuming it.
    fn peek(&self) -> Option<TaskSnapshot>;

    /// Consume and return the highest-effective-priority eligible entry.
    fn next(&self) -> Option<ScheduledTask<P>>;

    /// Consume the highest-effective-priority eligible entry whose cost the
    /// predicate accepts, skipping entries it rejects.
    ///
    /// The predicate is consulted once per candidate, in priority order, and
    /// the first accepted candidate is consumed under the source's lock —
    /// callers may reserve capacity inside the predicate so a consumed task
    /// is never left unschedulable.
    fn next_affordable(
        &self,
        affordable: &dyn Fn(&ResourceCost) -> bool,
    ) -> Option<ScheduledTask<P>>;

    /// Record successful completion of an in-flight task.
    fn complete(&self, key: TaskId) -> Result<bool, SchedulerError>;

    /// Record a failed attempt and make the task eligible again (retry).
    fn fail(&self, key: TaskId) -> Result<bool, SchedulerError>;

    /// Abort a task and everything that transitively depends on it.
    /// Returns the aborted keys.
    fn abort(&self, key: TaskId) -> Result<Vec<TaskId>, SchedulerError>;

    /// Whether the key was aborted; outcomes for such tasks are stale.
    fn was_aborted(&self, key: TaskId) -> bool;

    /// Mark that no further enqueues will arrive.
    fn close(&self);

    /// Whether the source was closed.
    fn is_closed(&self) -> bool;

    /// Closed, nothing waiting, nothing in flight.
    fn is_drained(&self) -> bool;

    /// Closed with entries that can never become eligible (nothing running
    /// that could unblock them). A wedged run should terminate, not hang.
    fn is_wedged(&self) -> bool;

    /// Readiness epoch: bumped on enqueue and whenever eligibility changes.
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Number of waiting (not yet consumed) entries.
    fn len(&self) -> usize;

    /// Whether no entries are waiting.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Entry<P> {
    task: ScheduledTask<P>,
    enqueued_at_ms: u64,
    seq: u64,
}

/// Pick the best key among candidates: highest effective priority, ties
/// broken FIFO by enqueue time, then by enqueue sequence.
fn pick_best<'a, P, I>(candidates: I, aging: &AgingPolicy, now_ms: u64) -> Option<TaskId>
where
    P: 'a,
    I: Iterator<Item = (&'a TaskId, &'a Entry<P>)>,
{
    let mut best: Option<(f64, u64, u64, TaskId)> = None;
    for (key, entry) in candidates {
        let waited = now_ms.saturating_sub(entry.enqueued_at_ms);
        let effective = entry.task.meta.priority + aging.boost(waited);
        let better = match &best {
            None => true,
            Some((best_eff, best_at, best_seq, _)) => {
                effective > *best_eff
                    || (effective == *best_eff
                        && (entry.enqueued_at_ms < *best_at
                            || (entry.enqueued_at_ms == *best_at && entry.seq < *best_seq)))
            }
        };
        if better {
            best = Some((effective, entry.enqueued_at_ms, entry.seq, *key));
        }
    }
    best.map(|(_, _, _, key)| key)
}

#[derive(Debug)]
struct PriorityState<P> {
    waiting: HashMap<TaskId, Entry<P>>,
    in_flight: HashMap<TaskId, Entry<P>>,
    aborted: HashSet<TaskId>,
    closed: bool,
    next_seq: u64,
}

/// Priority-only task source for pure QoS queues; no dependency graph.
///
/// Failed tasks return to the queue with their original enqueue time, so an
/// entry's aging boost survives retries.
pub struct PrioritySource<P> {
    state: Mutex<PriorityState<P>>,
    aging: AgingPolicy,
    clock: Arc<dyn Clock>,
    epoch_tx: watch::Sender<u64>,
}

impl<P: Clone + Send + 'static> PrioritySource<P> {
    /// Create a source with the given aging policy and clock.
    pub fn new(aging: AgingPolicy, clock: Arc<dyn Clock>) -> Self {
        let (epoch_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(PriorityState {
                waiting: HashMap::new(),
                in_flight: HashMap::new(),
                aborted: HashSet::new(),
                closed: false,
                next_seq: 0,
            }),
            aging,
            clock,
            epoch_tx,
        }
    }

    /// Enqueue a task. Its `created_at_ms` is stamped from the source clock.
    pub fn enqueue(&self, mut task: ScheduledTask<P>) -> Result<(), SchedulerError> {
        let id = task.meta.id;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SchedulerError::SourceClosed);
            }
            if state.waiting.contains_key(&id)
                || state.in_flight.contains_key(&id)
                || state.aborted.contains(&id)
            {
                return Err(SchedulerError::DuplicateTask(id));
            }
            let now = self.clock.now_ms();
            task.meta.created_at_ms = now;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiting.insert(
                id,
                Entry {
                    task,
                    enqueued_at_ms: now,
                    seq,
                },
            );
        }
        debug!(task = id, "enqueued");
        self.signal();
        Ok(())
    }

    fn signal(&self) {
        self.epoch_tx.send_modify(|epoch| *epoch += 1);
    }

    fn consume(
        &self,
        affordable: Option<&dyn Fn(&ResourceCost) -> bool>,
    ) -> Option<ScheduledTask<P>> {
        let mut state = self.state.lock();
        let now = self.clock.now_ms();
        let key = match affordable {
            None => pick_best(state.waiting.iter(), &self.aging, now)?,
            Some(pred) => {
                let mut rejected: HashSet<TaskId> = HashSet::new();
                loop {
                    let candidates = state
                        .waiting
                        .iter()
                        .filter(|(k, _)| !rejected.contains(*k));
                    let candidate = pick_best(candidates, &self.aging, now)?;
                    if pred(&state.waiting[&candidate].task.meta.cost) {
                        break candidate;
                    }
                    rejected.insert(candidate);
                }
            }
        };
        let entry = state.waiting.remove(&key)?;
        let task = entry.task.clone();
        state.in_flight.insert(key, entry);
        Some(task)
    }
}

impl<P: Clone + Send + Sync + 'static> TaskSource<P> for PrioritySource<P> {
    fn peek(&self) -> Option<TaskSnapshot> {
        let state = self.state.lock();
        let now = self.clock.now_ms();
        let key = pick_best(state.waiting.iter(), &self.aging, now)?;
        let entry = &state.waiting[&key];
        Some(TaskSnapshot {
            id: key,
            cost: entry.task.meta.cost.clone(),
            effective_priority: entry.task.meta.priority
                + self.aging.boost(now.saturating_sub(entry.enqueued_at_ms)),
        })
    }

    fn next(&self) -> Option<ScheduledTask<P>> {
        self.consume(None)
    }

    fn next_affordable(
        &self,
        affordable: &dyn Fn(&ResourceCost) -> bool,
    ) -> Option<ScheduledTask<P>> {
        self.consume(Some(affordable))
    }

    fn complete(&self, key: TaskId) -> Result<bool, SchedulerError> {
        let mut state = self.state.lock();
        if state.aborted.contains(&key) {
            return Ok(false);
        }
        if state.in_flight.remove(&key).is_some() {
            Ok(true)
        } else {
            Err(SchedulerError::UnknownTask(key))
        }
    }

    fn fail(&self, key: TaskId) -> Result<bool, SchedulerError> {
        {
            let mut state = self.state.lock();
            if state.aborted.contains(&key) {
                return Ok(false);
            }
            let entry = state
                .in_flight
                .remove(&key)
                .ok_or(SchedulerError::UnknownTask(key))?;
            state.waiting.insert(key, entry);
        }
        self.signal();
        Ok(true)
    }

    fn abort(&self, key: TaskId) -> Result<Vec<TaskId>, SchedulerError> {
        let newly = {
            let mut state = self.state.lock();
            if state.aborted.contains(&key) {
                return Ok(Vec::new());
            }
            if state.waiting.remove(&key).is_none() && state.in_flight.remove(&key).is_none() {
                return Err(SchedulerError::UnknownTask(key));
            }
            state.aborted.insert(key);
            vec![key]
        };
        self.signal();
        Ok(newly)
    }

    fn was_aborted(&self, key: TaskId) -> bool {
        self.state.lock().aborted.contains(&key)
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.signal();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.waiting.is_empty() && state.in_flight.is_empty()
    }

    fn is_wedged(&self) -> bool {
        // Waiting entries here are always eligible; only capacity can stall
        // them, and capacity eventually releases.
        false
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    fn len(&self) -> usize {
        self.state.lock().waiting.len()
    }
}

#[derive(Debug)]
struct DependencyState<P> {
    graph: DependencyGraph,
    waiting: HashMap<TaskId, Entry<P>>,
    in_flight: HashMap<TaskId, Entry<P>>,
    closed: bool,
    next_seq: u64,
}

/// Dependency-aware task source: entries become eligible only when their
/// graph node is `Ready`, in effective-priority order among the ready set.
pub struct DependencySource<P> {
    state: Mutex<DependencyState<P>>,
    aging: AgingPolicy,
    clock: Arc<dyn Clock>,
    epoch_tx: watch::Sender<u64>,
}

impl<P: Clone + Send + 'static> DependencySource<P> {
    /// Create a source with the given aging policy and clock.
    pub fn new(aging: AgingPolicy, clock: Arc<dyn Clock>) -> Self {
        let (epoch_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(DependencyState {
                graph: DependencyGraph::new(),
                waiting: HashMap::new(),
                in_flight: HashMap::new(),
                closed: false,
                next_seq: 0,
            }),
            aging,
            clock,
            epoch_tx,
        }
    }

    /// Enqueue a task behind its dependencies.
    ///
    /// Dependencies must already be enqueued; cycle-closing edge sets are
    /// rejected with [`SchedulerError::Cycle`] and nothing is inserted.
    pub fn enqueue(
        &self,
        mut task: ScheduledTask<P>,
        deps: &[TaskId],
    ) -> Result<(), SchedulerError> {
        let id = task.meta.id;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SchedulerError::SourceClosed);
            }
            state.graph.add_node(id, deps)?;
            let now = self.clock.now_ms();
            task.meta.created_at_ms = now;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiting.insert(
                id,
                Entry {
                    task,
                    enqueued_at_ms: now,
                    seq,
                },
            );
        }
        debug!(task = id, ?deps, "enqueued");
        self.signal();
        Ok(())
    }

    /// Current graph state of a task, if known.
    pub fn task_state(&self, key: TaskId) -> Option<TaskState> {
        self.state.lock().graph.state(key)
    }

    /// Whether every enqueued task reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.state.lock().graph.is_done()
    }

    fn signal(&self) {
        self.epoch_tx.send_modify(|epoch| *epoch += 1);
    }

    fn consume(
        &self,
        affordable: Option<&dyn Fn(&ResourceCost) -> bool>,
    ) -> Option<ScheduledTask<P>> {
        let mut state = self.state.lock();
        let now = self.clock.now_ms();
        let key = {
            let mut rejected: HashSet<TaskId> = HashSet::new();
            loop {
                let candidates = state
                    .waiting
                    .iter()
                    .filter(|(k, _)| state.graph.is_ready(**k) && !rejected.contains(*k));
                let candidate = pick_best(candidates, &self.aging, now)?;
                match affordable {
                    Some(pred) if !pred(&state.waiting[&candidate].task.meta.cost) => {
                        rejected.insert(candidate);
                    }
                    _ => break candidate,
                }
            }
        };
        if let Err(e) = state.graph.start(key) {
            // Unreachable while selection and start share the lock.
            error!(task = key, error = %e, "failed to start a ready node");
            return None;
        }
        let entry = state.waiting.remove(&key)?;
        let task = entry.task.clone();
        state.in_flight.insert(key, entry);
        Some(task)
    }
}

impl<P: Clone + Send + Sync + 'static> TaskSource<P> for DependencySource<P> {
    fn peek(&self) -> Option<TaskSnapshot> {
        let state = self.state.lock();
        let now = self.clock.now_ms();
        let candidates = state
            .waiting
            .iter()
            .filter(|(k, _)| state.graph.is_ready(**k));
        let key = pick_best(candidates, &self.aging, now)?;
        let entry = &state.waiting[&key];
        Some(TaskSnapshot {
            id: key,
            cost: entry.task.meta.cost.clone(),
            effective_priority: entry.task.meta.priority
                + self.aging.boost(now.saturating_sub(entry.enqueued_at_ms)),
        })
    }

    fn next(&self) -> Option<ScheduledTask<P>> {
        self.consume(None)
    }

    fn next_affordable(
        &self,
        affordable: &dyn Fn(&ResourceCost) -> bool,
    ) -> Option<ScheduledTask<P>> {
        self.consume(Some(affordable))
    }

    fn complete(&self, key: TaskId) -> Result<bool, SchedulerError> {
        let recorded = {
            let mut state = self.state.lock();
            match state.graph.state(key) {
                None => return Err(SchedulerError::UnknownTask(key)),
                Some(TaskState::Aborted) => {
                    state.in_flight.remove(&key);
                    return Ok(false);
                }
                Some(_) => {}
            }
            let newly_ready = state.graph.complete(key)?;
            state.in_flight.remove(&key);
            debug!(task = key, ready = ?newly_ready, "completed");
            true
        };
        self.signal();
        Ok(recorded)
    }

    fn fail(&self, key: TaskId) -> Result<bool, SchedulerError> {
        {
            let mut state = self.state.lock();
            match state.graph.state(key) {
                None => return Err(SchedulerError::UnknownTask(key)),
                Some(TaskState::Aborted) => {
                    state.in_flight.remove(&key);
                    return Ok(false);
                }
                Some(_) => {}
            }
            state.graph.fail(key)?;
            state.graph.retry(key)?;
            let entry = state
                .in_flight
                .remove(&key)
                .ok_or(SchedulerError::UnknownTask(key))?;
            state.waiting.insert(key, entry);
            debug!(task = key, "failed; eligible for retry");
        }
        self.signal();
        Ok(true)
    }

    fn abort(&self, key: TaskId) -> Result<Vec<TaskId>, SchedulerError> {
        let aborted = {
            let mut state = self.state.lock();
            let aborted = state.graph.abort(key)?;
            for k in &aborted {
                state.waiting.remove(k);
                state.in_flight.remove(k);
            }
            if !aborted.is_empty() {
                warn!(task = key, cascade = ?aborted, "aborted with dependents");
            }
            aborted
        };
        self.signal();
        Ok(aborted)
    }

    fn was_aborted(&self, key: TaskId) -> bool {
        self.state.lock().graph.state(key) == Some(TaskState::Aborted)
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.signal();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.waiting.is_empty() && state.in_flight.is_empty()
    }

    fn is_wedged(&self) -> bool {
        let state = self.state.lock();
        state.closed
            && state.in_flight.is_empty()
            && !state.waiting.is_empty()
            && !state.waiting.keys().any(|k| state.graph.is_ready(*k))
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    fn len(&self) -> usize {
        self.state.lock().waiting.len()
    }
}
