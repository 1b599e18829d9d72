//! Siphon Core: configuration and logging shared by the controller crates.

pub mod config;
pub mod logging;

pub use config::{ControllerConfig, LogSettings, RetentionPolicy};
