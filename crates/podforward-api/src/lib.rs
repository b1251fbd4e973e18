//! HTTP surface for the port-forward session manager

pub mod handlers;
pub mod models;

use axum::{
    routing::{get, post},
    Json, Router,
};
use podforward_session::SessionManager;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;

/// Application state shared across handlers
pub struct AppState {
    pub manager: SessionManager,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Podforward API",
        version = "0.1.0",
        description = "REST API for on-demand port-forwards to Kubernetes pods",
        contact(
            name = "Podforward Team",
            email = "team@podforward.dev"
        )
    ),
    paths(
        handlers::forward,
        handlers::create_forward,
        handlers::stop_forward,
        handlers::list_forwards,
        handlers::get_forward,
        handlers::health_check,
    ),
    components(
        schemas(
            podforward_session::SessionView,
            podforward_session::SessionState,
            podforward_session::StopReason,
            models::StartForwardRequest,
            models::ForwardList,
            models::StopResponse,
            models::HealthResponse,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "forwards", description = "Port-forward session endpoints"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Allow cross-origin requests from any origin
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_cors: true,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, manager: SessionManager) -> Self {
        Self {
            config,
            state: Arc::new(AppState { manager }),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(handlers::health_check))
            .route(
                "/api/v1/extensions/pod-forward/forward",
                get(handlers::forward),
            )
            .route(
                "/api/v1/extensions/pod-forward/forwards",
                post(handlers::create_forward),
            )
            .route(
                "/api/v1/extensions/pod-forward/stop/{id}",
                post(handlers::stop_forward),
            )
            .route(
                "/api/v1/extensions/pod-forward/status",
                get(handlers::list_forwards),
            )
            .route(
                "/api/v1/extensions/pod-forward/status/{id}",
                get(handlers::get_forward),
            )
            .route("/api/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
            .with_state(self.state.clone());

        let mut router = router.layer(TraceLayer::new_for_http());
        if self.config.enable_cors {
            // The dashboard extension calls in from another origin
            router = router.layer(CorsLayer::permissive());
        }
        router
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}
