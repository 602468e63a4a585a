//! # Taskloom
//!
//! A dependency-aware, priority-ordered, capacity-constrained task scheduler.
//!
//! Taskloom drives units of work through a small set of composable pieces:
//! a [`core::DependencyGraph`] tracks per-task lifecycle and readiness, task
//! sources hand out eligible work in effective-priority order, capacity
//! sources account for multi-resource costs (with hierarchical chains and
//! timer-replenished quotas), and the [`core::TaskPoolRunner`] ties them
//! together into a run that streams progress envelopes back to the caller.
//!
//! ## Scheduling model
//!
//! - **Dependencies**: a task becomes eligible only when every task it
//!   depends on has completed. Aborting a task aborts everything that
//!   transitively depends on it.
//! - **Priority with aging**: among eligible tasks, the highest effective
//!   priority wins; waiting tasks gain a bounded, configurable boost so low
//!   priorities cannot starve. Ties dequeue FIFO.
//! - **Capacity**: a task starts only once its entire multi-resource cost is
//!   reserved atomically. Unaffordable tasks are skipped in favor of cheaper
//!   eligible ones, so an expensive head never blocks the queue.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskloom::core::{
//!     AbortOnError, AgingPolicy, DependencySource, ResourceCapacity, ResourceCost,
//!     ScheduledTask, TaskMetadata, TaskPoolRunner,
//! };
//! use taskloom::util::SystemClock;
//!
//! let source = Arc::new(DependencySource::new(
//!     AgingPolicy { rate_per_ms: 0.001, max_boost: 5.0 },
//!     Arc::new(SystemClock),
//! ));
//! let capacity = Arc::new(ResourceCapacity::new(
//!     ResourceCost::new().with("cpu", 8).with("vram", 24),
//! ));
//!
//! source.enqueue(fetch_task, &[])?;
//! source.enqueue(transform_task, &[fetch_id])?;
//! source.close();
//!
//! let runner = TaskPoolRunner::new(source, capacity, my_executor, AbortOnError);
//! let mut run = runner.run_tasks(false);
//! while let Some(envelope) = run.next_envelope().await? {
//!     println!("{envelope:?}");
//! }
//! ```
//!
//! Capacity pools and aging can also be built from JSON configuration; see
//! [`config::SchedulerConfig`] and [`builders::build_capacities`].

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Configuration models for capacity pools, quotas, and aging.
pub mod config;
/// Core scheduling abstractions: graph, sources, capacity, runner.
pub mod core;
/// Shared utilities.
pub mod util;
