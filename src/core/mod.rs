//! Core scheduling components: dependency graph, capacity accounting, task
//! sources, and the pool runner that drives them.

pub mod capacity;
pub mod error;
pub mod graph;
pub mod runner;
pub mod source;
pub mod task;

pub use capacity::{
    AcquireOutcome, CapacitySource, CapacityStats, QuotaCapacity, ResourceCapacity, ResourceCost,
};
pub use error::SchedulerError;
pub use graph::{DependencyGraph, TaskState};
pub use runner::{
    AbortOnError, FailureDecision, FailurePolicy, RetryWithLimit, RunnerStats, TaskPoolRunner,
    TaskRun,
};
pub use source::{AgingPolicy, DependencySource, PrioritySource, TaskSnapshot, TaskSource};
pub use task::{
    ProgressSender, ScheduledTask, TaskExecutor, TaskId, TaskMetadata, TaskProgressEnvelope,
};
