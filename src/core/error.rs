//! Error types for scheduler operations.

use thiserror::Error;

use crate::core::graph::TaskState;
use crate::core::task::TaskId;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Adding the node or edge would close a dependency cycle.
    /// Rejected at construction time, never a runtime surprise.
    #[error("task {0} would close a dependency cycle")]
    Cycle(TaskId),
    /// The task key is already present.
    #[error("task {0} is already present")]
    DuplicateTask(TaskId),
    /// The task key is not known to the graph or source.
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    /// A lifecycle operation was applied to a node in the wrong state.
    /// Programmer error; should be loud.
    #[error("invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        /// Task the operation targeted.
        task: TaskId,
        /// State the node was actually in.
        from: TaskState,
        /// State the operation tried to reach.
        to: TaskState,
    },
    /// `acquire_immediate` was called without a successful `can_acquire` in
    /// the same synchronous turn.
    #[error("capacity exceeded: acquisition without a successful availability check")]
    CapacityExceeded,
    /// Enqueue attempted after the source was closed.
    #[error("task source is closed")]
    SourceClosed,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Wraps whatever a task's own work returned as an error.
    /// Recoverable via retry or abort, never silently dropped.
    #[error("task {task} failed: {message}")]
    TaskExecution {
        /// Task whose execution failed.
        task: TaskId,
        /// Rendered error from the task's work.
        message: String,
    },
}
