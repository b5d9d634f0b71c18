pub mod telemetry;

pub use telemetry::{telemetry, ConsoleLogging};
