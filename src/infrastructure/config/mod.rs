//! Application configuration.

pub mod app_config;
pub mod args;

pub use app_config::{CacheConfig, ConfigError, LogLevel};
pub use args::{CliArgs, Command};
