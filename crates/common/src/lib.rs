pub mod config;
pub mod logging;
pub mod telemetry;

pub use config::{Environment, LogLevel};
pub use logging::{init_observability, setup_logging};
pub use telemetry::TelemetryGuard;
