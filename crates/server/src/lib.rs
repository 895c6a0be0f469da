//! rethrottle server library.
//!
//! Provides the throttling middleware and a reusable server function to serve rethrottle
//! either for the binary, or for the tests.

#![deny(missing_docs)]

mod health;
mod throttle;

use std::{net::SocketAddr, sync::Arc};

use ::throttle::{CounterStore, Throttle};
use anyhow::anyhow;
use axum::{Router, routing::get};
use config::{Config, ServerConfig};
use tokio::net::TcpListener;

pub use self::throttle::{
    AcceptHandler, BUSY_MESSAGE, PassThrough, Proceed, RejectHandler, ServiceBusy, ThrottleLayer, ThrottleService,
    ThrottleUpdate,
};

/// Configuration for serving rethrottle.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to
    pub listen_address: SocketAddr,
    /// The deserialized rethrottle TOML configuration.
    pub config: Config,
}

/// Starts and runs the rethrottle server until ctrl-c.
pub async fn serve(ServeConfig { listen_address, config }: ServeConfig) -> anyhow::Result<()> {
    config.validate()?;

    let throttle = Throttle::connect(config.throttle.clone())
        .await
        .map_err(|e| anyhow!("Failed to initialize the throttle: {e}"))?;

    log::debug!(
        "Throttling to {} requests per {:?} per client",
        config.throttle.max_requests_per_interval,
        config.throttle.interval
    );

    let layer = ThrottleLayer::new(Arc::new(throttle)).trust_forwarded_headers(config.server.trust_forwarded_headers);
    let app = router(layer, &config.server);

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    log::info!("Listening on http://{listen_address}");

    if config.server.health.enabled {
        log::info!(
            "Health check endpoint exposed at http://{listen_address}{}",
            config.server.health.path
        );
    }

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow!("Failed to start HTTP server: {e}"))?;

    Ok(())
}

/// The application routes: `/` behind the throttle and, when enabled, the health endpoint
/// outside of it.
pub fn router<S>(layer: ThrottleLayer<S>, server: &ServerConfig) -> Router
where
    S: CounterStore + 'static,
{
    let mut app = Router::new().route("/", get(hello)).layer(layer);

    if server.health.enabled {
        app = app.route(&server.health.path, get(health::health));
    }

    app
}

async fn hello() -> &'static str {
    "Hello World!"
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Shutting down"),
        Err(e) => log::error!("Failed to listen for the shutdown signal: {e}"),
    }
}
