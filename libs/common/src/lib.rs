//! `VoltageEMS` channel access basic library
//!
//! Provides functions shared by every crate in the workspace:
//! - logging functions
//! - layered configuration loading

pub mod config_loader;
pub mod logging;

pub use config_loader::{get_config_value, load_config, load_config_from_file, load_config_in};
pub use logging::LogConfig;
