//! Task model: metadata, executor seam, progress envelopes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::capacity::ResourceCost;

/// Opaque, unique, comparable identifier for one unit of work. Owned by the
/// caller; the graph and sources only reference it.
pub type TaskId = u64;

/// Metadata driving scheduling decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Unique task identifier.
    pub id: TaskId,
    /// Resource cost for capacity accounting.
    pub cost: ResourceCost,
    /// Base priority; aging adds a bounded boost on top.
    pub priority: f64,
    /// Enqueue timestamp in milliseconds, stamped by the source.
    pub created_at_ms: u64,
}

/// A schedulable task with metadata and payload.
#[derive(Debug, Clone)]
pub struct ScheduledTask<P> {
    /// Metadata driving scheduling decisions.
    pub meta: TaskMetadata,
    /// Task payload supplied by the caller.
    pub payload: P,
}

/// Tagged progress/result/error record emitted per value a running task
/// yields, returns, or fails with. The only output channel of the runner.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskProgressEnvelope<T> {
    /// One yielded value from a streaming task.
    Intermediate {
        /// Task that produced the value.
        task_id: TaskId,
        /// The yielded value.
        value: T,
    },
    /// The task's final settled value.
    Final {
        /// Task that produced the value.
        task_id: TaskId,
        /// The settled value.
        value: T,
    },
    /// The task's execution failed.
    Error {
        /// Task whose execution failed.
        task_id: TaskId,
        /// Rendered error from the task's work.
        message: String,
    },
}

impl<T> TaskProgressEnvelope<T> {
    /// Task this envelope belongs to.
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Intermediate { task_id, .. }
            | Self::Final { task_id, .. }
            | Self::Error { task_id, .. } => *task_id,
        }
    }

    /// Whether this is an `Error` envelope.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Whether this is a `Final` envelope.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final { .. })
    }
}

/// Handle an executor uses to push intermediate values while it runs.
///
/// Each pushed value surfaces immediately as an `Intermediate` envelope;
/// the executor's return value becomes the `Final` one.
#[derive(Debug)]
pub struct ProgressSender<T> {
    task_id: TaskId,
    tx: mpsc::Sender<TaskProgressEnvelope<T>>,
}

impl<T> Clone for ProgressSender<T> {
    fn clone(&self) -> Self {
        Self {
            task_id: self.task_id,
            tx: self.tx.clone(),
        }
    }
}

impl<T> ProgressSender<T> {
    pub(crate) fn new(task_id: TaskId, tx: mpsc::Sender<TaskProgressEnvelope<T>>) -> Self {
        Self { task_id, tx }
    }

    /// Emit one intermediate value. Returns false if the consumer is gone,
    /// letting long streams bail out early.
    pub async fn send(&self, value: T) -> bool {
        self.tx
            .send(TaskProgressEnvelope::Intermediate {
                task_id: self.task_id,
                value,
            })
            .await
            .is_ok()
    }
}

/// Abstraction for executing a task payload and producing a result.
///
/// One-shot tasks return their value directly; streaming tasks push
/// intermediates through `progress` first. Errors are handed to the runner's
/// failure policy, never swallowed.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone)]
/// struct ChunkedUpload;
///
/// #[async_trait]
/// impl TaskExecutor<Vec<u8>, usize> for ChunkedUpload {
///     async fn execute(
///         &self,
///         payload: Vec<u8>,
///         _meta: TaskMetadata,
///         progress: ProgressSender<usize>,
///     ) -> anyhow::Result<usize> {
///         let mut sent = 0;
///         for chunk in payload.chunks(1024) {
///             sent += chunk.len();
///             progress.send(sent).await;
///         }
///         Ok(sent)
///     }
/// }
/// ```
#[async_trait]
pub trait TaskExecutor<P, T>: Send + Sync + Clone + 'static
where
    P: Send + 'static,
    T: Send + 'static,
{
    /// Execute a task payload and return the final result.
    async fn execute(
        &self,
        payload: P,
        meta: TaskMetadata,
        progress: ProgressSender<T>,
    ) -> anyhow::Result<T>;
}
