//! CLI command implementations.

mod config;
mod start;
mod toolkit;

pub use config::run_check_config;
pub use start::run_start;
pub use toolkit::run_simulate;
