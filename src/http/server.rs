//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with the bridge in front of the host handlers
//! - Wire up middleware (tracing, timeout, request ID)
//! - Serve a plain listener and an optional TLS listener
//! - Stop both listeners on the shared shutdown signal

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, Extension, Router};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::bridge::{BridgeOptions, OwinBridge};
use crate::config::{BridgeConfig, ConfigError, TlsConfig};
use crate::http::request::{ConnectionInfo, X_REQUEST_ID};
use crate::lifecycle::Shutdown;
use crate::net::tls::load_tls_config;
use crate::pipeline::Pipeline;

/// HTTP server hosting the pipeline bridge.
pub struct HttpServer {
    router: Router,
    config: BridgeConfig,
    bridge: OwinBridge,
}

impl HttpServer {
    /// Create a server whose only host handler is the 404 fallback.
    pub fn new(config: BridgeConfig, pipeline: Arc<dyn Pipeline>) -> Result<Self, ConfigError> {
        Self::with_routes(config, pipeline, Router::new().fallback(not_found))
    }

    /// Create a server that falls through to `host` when the pipeline
    /// declines a request.
    pub fn with_routes(config: BridgeConfig, pipeline: Arc<dyn Pipeline>, host: Router) -> Result<Self, ConfigError> {
        let options = BridgeOptions::try_from(config.pipeline.options.clone())?;
        let bridge = OwinBridge::new(options, pipeline).with_body_limit(config.limits.max_body_size);
        let router = Self::build_router(&config, &bridge, host);

        Ok(Self { router, config, bridge })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &BridgeConfig, bridge: &OwinBridge, host: Router) -> Router {
        bridge
            .attach(host)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid))
    }

    /// Router for a listener with the given transport.
    pub fn router(&self, encrypted: bool) -> Router {
        self.router.clone().layer(Extension(ConnectionInfo { encrypted }))
    }

    pub fn bridge(&self) -> &OwinBridge {
        &self.bridge
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let tls_task = match &self.config.listener.tls {
            Some(tls) => Some(self.spawn_tls(tls, shutdown.subscribe()).await?),
            None => None,
        };

        let mut rx = shutdown.subscribe();
        let served = axum::serve(listener, self.router(false))
            .with_graceful_shutdown(async move {
                let _ = rx.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await;

        finish(served, &shutdown, tls_task).await?;
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    async fn spawn_tls(
        &self,
        tls: &TlsConfig,
        mut rx: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<Result<(), std::io::Error>>, std::io::Error> {
        let addr: SocketAddr = tls.bind_address.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid TLS bind address {}: {e}", tls.bind_address),
            )
        })?;
        let rustls = load_tls_config(tls).await?;
        let grace = Duration::from_secs(self.config.timeouts.shutdown_grace_secs);

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            let _ = rx.recv().await;
            shutdown_handle.graceful_shutdown(Some(grace));
        });

        tracing::info!(address = %addr, "TLS listener starting");
        let app = self.router(true);
        Ok(tokio::spawn(async move {
            axum_server::bind_rustls(addr, rustls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }))
    }
}

/// Wait for the TLS listener once the plain one has stopped. A failed plain
/// listener stops the TLS listener too.
async fn finish(
    served: Result<(), std::io::Error>,
    shutdown: &Shutdown,
    tls_task: Option<JoinHandle<Result<(), std::io::Error>>>,
) -> Result<(), std::io::Error> {
    if let Err(e) = &served {
        tracing::error!(error = %e, "HTTP listener failed");
        shutdown.trigger();
    }

    if let Some(task) = tls_task {
        match task.await {
            Ok(Err(e)) if served.is_ok() => return Err(e),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "TLS listener task failed"),
        }
    }

    served
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}
