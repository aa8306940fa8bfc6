//! Management API server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::Method;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::handlers::{self, AppState};
use crate::error::{CoreError, CoreResult};

pub struct ApiServer {
    address: SocketAddr,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(address: SocketAddr, state: Arc<AppState>) -> Self {
        Self { address, state }
    }

    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/devices", get(handlers::list_devices).post(handlers::register_device))
            .route("/devices/pending", get(handlers::list_pending_devices))
            .route("/devices/:device_id", get(handlers::get_device))
            .route("/devices/:device_id/approve", post(handlers::approve_device))
            .route("/devices/:device_id/reject", post(handlers::reject_device))
            .route("/devices/:device_id/revoke", post(handlers::revoke_device))
            .route("/devices/:device_id/release", post(handlers::release_device))
            .route("/devices/:device_id/trust", get(handlers::get_trust_score))
            .route(
                "/devices/:device_id/trust/history",
                get(handlers::get_trust_history),
            )
            .route("/devices/:device_id/policy", get(handlers::get_policy))
            .route("/devices/:device_id/baseline", get(handlers::get_baseline))
            .route(
                "/devices/:device_id/finalize",
                post(handlers::finalize_onboarding),
            )
            .route("/audit", get(handlers::get_decisions_audit))
            .route("/threats", get(handlers::list_threats))
            .route("/topology", get(handlers::get_topology))
            .route("/status", get(handlers::get_status))
            .layer(
                CorsLayer::new()
                    .allow_methods([Method::GET, Method::POST])
                    .allow_headers([CONTENT_TYPE, ACCEPT]),
            )
            .with_state(state)
    }

    pub async fn run(&self) -> CoreResult<()> {
        let app = Self::router(Arc::clone(&self.state));

        info!("[API] Management API listening on {}", self.address);

        let listener = tokio::net::TcpListener::bind(self.address)
            .await
            .map_err(|e| CoreError::Config {
                key: "api_listen",
                reason: format!("failed to bind {}: {}", self.address, e),
            })?;

        axum::serve(listener, app)
            .await
            .map_err(|e| CoreError::transient(format!("api server: {}", e)))?;

        Ok(())
    }
}
