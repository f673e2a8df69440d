//! Configuration Module
//!
//! Configuration loading for the relay.

mod settings;

pub use settings::{ConfigError, RedisUrl, RelayConfig, RelayMode, ServerSettings};
