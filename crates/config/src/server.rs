//! HTTP server configuration settings.

use std::net::SocketAddr;

use serde::Deserialize;

use crate::HealthConfig;

/// HTTP server configuration settings.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// The socket address the server should listen on.
    pub listen_address: Option<SocketAddr>,
    /// Whether `X-Forwarded-For` and `X-Real-IP` take precedence over the socket address
    /// when deriving the client key. Only enable this behind a proxy that overwrites them.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    /// Health endpoint configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

impl ServerConfig {
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        self.health.validate()
    }
}
