//! HTTP API Module
//!
//! Provides the HTTP server with the binary WebSocket endpoint and the
//! health/liveness probes.

pub mod dto;
pub mod handlers;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::config::HttpConfig;
use crate::protocol::Gateway;

use self::handlers::{admin, ws};

/// Creates the Axum router
pub fn create_router(gateway: Arc<Gateway>, config: &HttpConfig) -> Router {
    let cors = if config.cors_allow_all {
        // Explicit dev mode opt-in: allow all origins
        Some(CorsLayer::permissive())
    } else if !config.cors_origins.is_empty() {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|s| {
                let parsed = s.parse();
                if parsed.is_err() {
                    tracing::warn!(origin = %s, "invalid_cors_origin_ignored");
                }
                parsed.ok()
            })
            .collect();
        Some(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        // Same-origin only
        None
    };

    let mut app = Router::new()
        .route("/health", get(admin::health))
        .route("/live", get(admin::liveness))
        .route(&config.ws_path, get(ws::websocket));
    if config.ws_path != "/ws" {
        app = app.route("/ws", get(ws::websocket));
    }
    let mut app = app.layer(Extension(gateway));

    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    app
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// Peer addresses are attached to every request; the WebSocket handler keys
/// per-client rate limits on them.
pub async fn serve<F>(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    config: &HttpConfig,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(gateway, config);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// Starts the HTTP server with graceful shutdown support.
///
/// Listens for SIGINT (ctrl-c) and SIGTERM to trigger graceful shutdown.
/// Open WebSocket connections are not waited for; the caller drains the
/// dispatch loop afterwards.
pub async fn start_http_server(
    gateway: Arc<Gateway>,
    config: &HttpConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;

    tracing::info!(%addr, ws_path = %config.ws_path, "http_server_listening");

    serve(listener, gateway, config, shutdown_signal()).await?;

    tracing::info!("http_server_stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = ctrl_c => tracing::info!("received_sigint"),
                    _ = sigterm.recv() => tracing::info!("received_sigterm"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "sigterm_handler_unavailable");
                ctrl_c.await;
                tracing::info!("received_sigint");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        tracing::info!("received_sigint");
    }
}
