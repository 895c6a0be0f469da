//! Health endpoint configuration.

use std::borrow::Cow;

use anyhow::bail;
use serde::Deserialize;

/// Health endpoint configuration. The endpoint is never throttled.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Whether the health endpoint is enabled.
    pub enabled: bool,
    /// The path for the health endpoint.
    pub path: Cow<'static, str>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            enabled: true,
            path: Cow::Borrowed("/health"),
        }
    }
}

impl HealthConfig {
    /// The path must be absolute and must not shadow the throttled root route.
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if !self.path.starts_with('/') {
            bail!("health path must start with '/', got {:?}", self.path);
        }

        if self.path == "/" {
            bail!("health path must not be '/', which is the throttled route");
        }

        Ok(())
    }
}
