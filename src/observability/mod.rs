//! Logging and health reporting.

pub mod health;
pub mod logging;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
