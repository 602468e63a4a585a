//! Configuration models for capacity pools, quotas, and aging.

pub mod scheduler;

pub use scheduler::{AgingConfig, CapacityConfig, ReplenishConfig, SchedulerConfig};
