//! Shared utilities.

pub mod clock;
pub mod telemetry;
pub mod window;

pub use clock::{now_ms, Clock, ManualClock, SystemClock};
pub use telemetry::init_tracing;
pub use window::RollingWindow;
