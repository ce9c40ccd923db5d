//! HTTP server for the failover status surface
//!
//! The peer controller's RPC client and `failoverctl` both talk to this.

use super::handler::{
    event_handler, force_master_handler, in_progress_handler, pools_handler,
    refresh_status_handler, status_handler,
};
use crate::subscriber::Subscriber;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub subscriber: Arc<Subscriber>,
}

/// Build the router with every route mounted
pub fn router(subscriber: Arc<Subscriber>) -> Router {
    Router::new()
        .route("/api/failover/status", get(status_handler))
        .route("/api/failover/status/refresh", post(refresh_status_handler))
        .route("/api/failover/pools", get(pools_handler))
        .route("/api/failover/in_progress", get(in_progress_handler))
        .route("/api/failover/event", post(event_handler))
        .route("/api/failover/force_master", post(force_master_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { subscriber })
}

/// HTTP server bound to the configured address
pub struct HttpServer {
    subscriber: Arc<Subscriber>,
    address: String,
    port: u16,
}

impl HttpServer {
    pub fn new(subscriber: Arc<Subscriber>, address: impl Into<String>, port: u16) -> Self {
        Self {
            subscriber,
            address: address.into(),
            port,
        }
    }

    /// Serve until the listener fails
    pub async fn start(&self) -> std::io::Result<()> {
        let app = router(Arc::clone(&self.subscriber));
        let addr = format!("{}:{}", self.address, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!("Failover status surface listening on {}", addr);

        axum::serve(listener, app).await
    }
}
