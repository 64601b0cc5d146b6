//! API server: HTTP control/tracking surface and the metrics exporter.

use crate::rest::{self, AppState};
use crate::tracking_rest;
use axum::routing::{get, post};
use axum::Router;
use campaign_core::config::AppConfig;
use campaign_flow::FlowEngine;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Builds the full route table over the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Campaign control
        .route("/v1/campaigns/:id", get(rest::campaign_summary))
        .route("/v1/campaigns/:id/flows", post(rest::activate_flow))
        .route("/v1/campaigns/:id/enroll", post(rest::enroll_lead))
        .route("/v1/campaigns/:id/pause", post(rest::pause_campaign))
        .route("/v1/campaigns/:id/cancel", post(rest::cancel_campaign))
        .route("/v1/campaigns/:id/resume", post(rest::resume_campaign))
        .route("/v1/campaigns/:id/leads/:lead_id", get(rest::lead_cursors))
        // Engagement tracking
        .route("/t/open", get(tracking_rest::track_open))
        .route("/t/click", get(tracking_rest::track_click))
        .route("/v1/webhooks/reply", post(tracking_rest::webhook_reply))
        .route("/v1/webhooks/bounce", post(tracking_rest::webhook_bounce))
        .route("/v1/webhooks/unsubscribe", post(tracking_rest::webhook_unsubscribe))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Main API server.
pub struct ApiServer {
    config: AppConfig,
    engine: FlowEngine,
}

impl ApiServer {
    pub fn new(config: AppConfig, engine: FlowEngine) -> Self {
        Self { config, engine }
    }

    /// Start the HTTP server; returns once `shutdown` resolves and in-flight
    /// requests have drained.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(AppState::new(self.engine.clone(), self.config.node_id.clone()));

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);
        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        if !self.config.metrics.enabled {
            info!("Metrics exporter disabled");
            return Ok(());
        }

        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
