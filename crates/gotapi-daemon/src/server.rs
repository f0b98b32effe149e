//! Server wiring: plugin loading, the axum router, and the listener.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{any, get};
use gotapi_core::GatewayCore;
use gotapi_core::config::Config;
use tokio::net::TcpListener;
use tracing::info;

use crate::access::AccessPolicy;
use crate::error::{DaemonError, Result};
use crate::ws::WsSettings;
use crate::{http, plugins, ws};

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<GatewayCore>,
    pub access: Arc<AccessPolicy>,
    pub(crate) ws: Arc<WsSettings>,
}

impl AppState {
    #[must_use]
    pub fn new(config: &Config, core: Arc<GatewayCore>) -> Self {
        Self {
            core,
            access: Arc::new(AccessPolicy::new(config)),
            ws: Arc::new(WsSettings::new(config)),
        }
    }

    /// Open WebSocket connections.
    #[must_use]
    pub fn ws_connections(&self) -> usize {
        self.ws.active()
    }
}

/// Build the HTTP router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/gotapi/websocket", get(ws::upgrade))
        .route("/gotapi/{profile}", any(http::profile_only))
        .route("/gotapi/{profile}/{attribute}", any(http::with_attribute))
        .fallback(http::not_found)
        .with_state(state)
}

/// Serve `state` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Load the configured plugins, start the gateway and serve until Ctrl+C.
///
/// # Errors
///
/// Returns an error if the listen address cannot be bound or the server
/// fails.
pub async fn run(config: Config) -> Result<()> {
    let registrations = plugins::catalog(&config.plugins).load();
    let core = GatewayCore::start(&config, registrations);
    let state = AppState::new(&config, core);

    let addr = format!("{}:{}", config.gotapi_if_host, config.gotapi_if_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| DaemonError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!("GotAPI server listening on {addr}");

    serve(listener, state, shutdown_signal()).await?;
    info!("GotAPI server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown requested");
    }
}
