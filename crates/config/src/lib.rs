//! rethrottle configuration structures to map the rethrottle.toml configuration.

#![deny(missing_docs)]

mod health;
mod loader;
mod server;
mod throttle;

use std::path::Path;

pub use health::HealthConfig;
pub use server::ServerConfig;
pub use throttle::*;

use serde::Deserialize;

/// Main configuration structure for the rethrottle application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Request throttling configuration settings.
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates the bounds of every configured value.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server.validate()?;
        self.throttle.validate()
    }
}
