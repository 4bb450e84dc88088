//! Connection health tracking and the reconnect timer.

pub mod monitor;
pub mod timer;

pub use monitor::ConnectionMonitor;
pub use timer::{ReconnectTimer, DEFAULT_RECURRENCE};
