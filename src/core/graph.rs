//! Directed acyclic dependency graph with an explicit task state machine.
//!
//! The graph tracks task keys only; it knows nothing about resources or
//! priority. Acyclicity is enforced at insertion, so a cycle is a rejected
//! construction rather than a latent runtime bug.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::debug;

use crate::core::error::SchedulerError;
use crate::core::task::TaskId;

/// Lifecycle state of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting on unmet dependencies.
    Pending,
    /// All dependencies completed; eligible for scheduling.
    Ready,
    /// Consumed by the runner and currently executing.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Execution failed; awaiting an explicit retry or abort decision.
    Failed,
    /// Abandoned, directly or by cascade. Terminal.
    Aborted,
}

impl TaskState {
    /// Whether the state is terminal (`Completed` or `Aborted`).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Internal node: immediate deps, immediate dependents, current state.
#[derive(Debug)]
struct Node {
    deps: HashSet<TaskId>,
    dependents: HashSet<TaskId>,
    state: TaskState,
}

/// Dependency graph over caller-owned task keys.
///
/// Invariants: the dependency relation is acyclic; a node is `Ready` iff
/// every dependency is `Completed`; failed nodes move on only by explicit
/// caller action ([`retry`](Self::retry) or [`abort`](Self::abort)).
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<TaskId, Node>,
    /// Count of nodes in a terminal state, so `is_done` is O(1).
    terminal: usize,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Current state of a node, if present.
    pub fn state(&self, key: TaskId) -> Option<TaskState> {
        self.nodes.get(&key).map(|n| n.state)
    }

    /// Whether the node exists and is `Ready`.
    pub fn is_ready(&self, key: TaskId) -> bool {
        self.state(key) == Some(TaskState::Ready)
    }

    /// Whether every node is `Completed` or `Aborted`.
    pub fn is_done(&self) -> bool {
        self.terminal == self.nodes.len()
    }

    /// Insert a node with its dependency set.
    ///
    /// Dependencies must already be present. Fails with
    /// [`SchedulerError::Cycle`] if the new edge set would close a cycle
    /// (reachability check from each dependency back to the new key); on any
    /// error the graph is left unchanged. The node starts `Ready` when every
    /// dependency is already `Completed` (or there are none), else `Pending`.
    pub fn add_node(&mut self, key: TaskId, deps: &[TaskId]) -> Result<(), SchedulerError> {
        if self.nodes.contains_key(&key) {
            return Err(SchedulerError::DuplicateTask(key));
        }
        for dep in deps {
            if *dep == key {
                return Err(SchedulerError::Cycle(key));
            }
            if !self.nodes.contains_key(dep) {
                return Err(SchedulerError::UnknownTask(*dep));
            }
        }
        for dep in deps {
            if self.reaches(*dep, key) {
                return Err(SchedulerError::Cycle(key));
            }
        }

        let all_completed = deps
            .iter()
            .all(|d| self.nodes[d].state == TaskState::Completed);
        let state = if deps.is_empty() || all_completed {
            TaskState::Ready
        } else {
            TaskState::Pending
        };

        for dep in deps {
            if let Some(node) = self.nodes.get_mut(dep) {
                node.dependents.insert(key);
            }
        }
        self.nodes.insert(
            key,
            Node {
                deps: deps.iter().copied().collect(),
                dependents: HashSet::new(),
                state,
            },
        );
        debug!(task = key, %state, "node added");
        Ok(())
    }

    /// Add a dependency edge to an existing node.
    ///
    /// Only allowed while the node is `Pending` or `Ready`. Fails with
    /// [`SchedulerError::Cycle`] if the edge would make the new key reachable
    /// from itself; the graph is left unchanged on error.
    pub fn add_dependency(&mut self, key: TaskId, dep: TaskId) -> Result<(), SchedulerError> {
        if key == dep {
            return Err(SchedulerError::Cycle(key));
        }
        let state = self
            .state(key)
            .ok_or(SchedulerError::UnknownTask(key))?;
        if !self.nodes.contains_key(&dep) {
            return Err(SchedulerError::UnknownTask(dep));
        }
        if !matches!(state, TaskState::Pending | TaskState::Ready) {
            return Err(SchedulerError::InvalidTransition {
                task: key,
                from: state,
                to: TaskState::Pending,
            });
        }
        if self.reaches(dep, key) {
            return Err(SchedulerError::Cycle(key));
        }

        let dep_completed = self.nodes[&dep].state == TaskState::Completed;
        if let Some(node) = self.nodes.get_mut(&key) {
            node.deps.insert(dep);
            if !dep_completed {
                node.state = TaskState::Pending;
            }
        }
        if let Some(node) = self.nodes.get_mut(&dep) {
            node.dependents.insert(key);
        }
        Ok(())
    }

    /// Transition a `Ready` node to `Running`.
    pub fn start(&mut self, key: TaskId) -> Result<(), SchedulerError> {
        self.transition(key, TaskState::Ready, TaskState::Running)
    }

    /// Transition a `Running` node to `Completed`.
    ///
    /// Re-evaluates the node's dependents and promotes every `Pending`
    /// dependent whose dependencies are now all `Completed` to `Ready`.
    /// Returns the newly ready keys.
    pub fn complete(&mut self, key: TaskId) -> Result<Vec<TaskId>, SchedulerError> {
        self.transition(key, TaskState::Running, TaskState::Completed)?;
        self.terminal += 1;

        let dependents: Vec<TaskId> = self.nodes[&key].dependents.iter().copied().collect();
        let mut newly_ready = Vec::new();
        for dependent in dependents {
            let satisfied = self.nodes[&dependent]
                .deps
                .iter()
                .all(|d| self.nodes[d].state == TaskState::Completed);
            if satisfied {
                if let Some(node) = self.nodes.get_mut(&dependent) {
                    if node.state == TaskState::Pending {
                        node.state = TaskState::Ready;
                        newly_ready.push(dependent);
                    }
                }
            }
        }
        debug!(task = key, ready = ?newly_ready, "node completed");
        Ok(newly_ready)
    }

    /// Transition a `Running` node to `Failed`.
    ///
    /// The node stays parked until the caller decides: [`retry`](Self::retry)
    /// back to `Ready`, or [`abort`](Self::abort) to give up. The graph never
    /// bounds retries; that is the caller's job.
    pub fn fail(&mut self, key: TaskId) -> Result<(), SchedulerError> {
        self.transition(key, TaskState::Running, TaskState::Failed)
    }

    /// Transition a `Failed` node back to `Ready` for another attempt.
    pub fn retry(&mut self, key: TaskId) -> Result<(), SchedulerError> {
        self.transition(key, TaskState::Failed, TaskState::Ready)
    }

    /// Abort a node and, recursively, every transitive dependent.
    ///
    /// All states except `Completed` are aborted; already-`Aborted` nodes are
    /// skipped. One atomic call; returns the newly aborted keys. Aborting an
    /// already-aborted node is a no-op returning an empty list.
    pub fn abort(&mut self, key: TaskId) -> Result<Vec<TaskId>, SchedulerError> {
        let state = self.state(key).ok_or(SchedulerError::UnknownTask(key))?;
        if state == TaskState::Completed {
            return Err(SchedulerError::InvalidTransition {
                task: key,
                from: state,
                to: TaskState::Aborted,
            });
        }

        let mut aborted = Vec::new();
        let mut stack = vec![key];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&current) else {
                continue;
            };
            if matches!(node.state, TaskState::Completed | TaskState::Aborted) {
                continue;
            }
            node.state = TaskState::Aborted;
            self.terminal += 1;
            aborted.push(current);
            stack.extend(node.dependents.iter().copied());
        }
        debug!(task = key, cascade = ?aborted, "abort cascade");
        Ok(aborted)
    }

    /// Whether `target` is reachable from `from` following dependency edges.
    fn reaches(&self, from: TaskId, target: TaskId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.deps.iter().copied());
            }
        }
        false
    }

    fn transition(
        &mut self,
        key: TaskId,
        from: TaskState,
        to: TaskState,
    ) -> Result<(), SchedulerError> {
        let node = self
            .nodes
            .get_mut(&key)
            .ok_or(SchedulerError::UnknownTask(key))?;
        if node.state != from {
            return Err(SchedulerError::InvalidTransition {
                task: key,
                from: node.state,
                to,
            });
        }
        node.state = to;
        debug!(task = key, %from, %to, "transition");
        Ok(())
    }
}
