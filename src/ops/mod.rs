//! Operations and observability.
//!
//! - `health` - Alerts and cluster health reports
//! - `telemetry` - Tracing setup and the HTTP health endpoint

pub mod health;
pub mod telemetry;

pub use health::*;
pub use telemetry::*;
