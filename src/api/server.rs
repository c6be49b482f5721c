//! HTTP server for the control API
//!
//! Binds the configured address, layers tracing, trace ids and CORS over the
//! routes, and shuts down gracefully on Ctrl+C or SIGTERM.

use crate::api::handlers::AppState;
use crate::api::middleware::trace_id_middleware;
use crate::api::routes::build_api_routes;
use crate::core::config::ServerConfig;
use crate::plugin::ExtensionManager;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

/// HTTP API Server
pub struct ApiServer {
    router: Router,
    config: ServerConfig,
}

impl ApiServer {
    pub fn new(config: ServerConfig, manager: Arc<ExtensionManager>) -> Self {
        let router = Self::build_router(&config, AppState::new(manager));
        Self { router, config }
    }

    fn build_router(config: &ServerConfig, state: AppState) -> Router {
        build_api_routes(state).layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(trace_id_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(Self::build_cors_layer(&config.allowed_origins)),
        )
    }

    fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
        let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

        if allowed_origins.iter().any(|o| o == "*") {
            cors.allow_origin(Any)
        } else {
            let origins: Vec<_> = allowed_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            cors.allow_origin(origins)
        }
    }

    /// Serve until a shutdown signal arrives
    pub async fn serve(self) -> anyhow::Result<()> {
        let socket_addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(socket_addr).await?;

        info!(addr = %socket_addr, "Control API listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Control API shut down gracefully");
        Ok(())
    }

    pub fn router(&self) -> &Router {
        &self.router
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TRACE_ID_HEADER;
    use crate::core::config::{CacheConfig, ExtensionsConfig};
    use crate::plugin::MemoryKvStore;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use std::path::PathBuf;
    use tower::util::ServiceExt;

    fn server(allowed_origins: Vec<String>) -> ApiServer {
        let manager = ExtensionManager::new(
            ExtensionsConfig {
                extension_dir: PathBuf::from("extensions"),
                profile: "default".to_string(),
                default_rate_limit_ms: 0,
                call_timeout_secs: 5,
                max_wasm_memory_bytes: 16 * 1024 * 1024,
                storage_quota_bytes: 1024 * 1024,
                load_builtin: false,
            },
            &CacheConfig {
                stream_ttl_secs: 600,
                listing_ttl_secs: 3600,
                hoster_info_ttl_secs: 86400,
            },
            Arc::new(MemoryKvStore::new()),
            None,
        )
        .unwrap();

        ApiServer::new(
            ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 7420,
                allowed_origins,
            },
            Arc::new(manager),
        )
    }

    #[tokio::test]
    async fn test_responses_carry_trace_id() {
        let router = server(vec!["*".to_string()]).router().clone();
        let response = router
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(TRACE_ID_HEADER));
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin() {
        let router = server(vec!["http://localhost:3000".to_string()]).router().clone();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .header(header::ORIGIN, "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:3000"
        );
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let router = server(vec!["*".to_string()]).router().clone();
        let response = router
            .oneshot(Request::builder().uri("/api/nothing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
