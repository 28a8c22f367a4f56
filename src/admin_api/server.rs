use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::admin_api::auth;
use crate::admin_api::routes::{self, AppState};

pub struct AdminApiServer {
    state: AppState,
    bind_addr: String,
}

/// All admin routes behind the API-key check.
pub fn build_router(state: AppState) -> Router {
    let api_key = state.api_key.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(routes::get_status))
        .route(
            "/api/blocklist",
            get(routes::get_blocklist).post(routes::add_to_blocklist),
        )
        .route("/api/blocklist/{address}", delete(routes::remove_from_blocklist))
        .route("/api/flags", get(routes::get_flags).post(routes::create_flag))
        .route("/api/flags/{id}/resolve", post(routes::resolve_flag))
        .route("/api/requests", get(routes::get_requests))
        .route("/api/jobs/{name}", post(routes::run_job))
        .layer(middleware::from_fn_with_state(api_key, auth::auth_middleware))
        .layer(cors)
        .with_state(state)
}

impl AdminApiServer {
    pub fn new(state: AppState, bind_addr: String) -> Self {
        Self { state, bind_addr }
    }

    pub async fn run(&self) -> Result<()> {
        let app = build_router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(&self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind admin API on {}", self.bind_addr))?;
        info!("Admin API listening on {}", self.bind_addr);
        axum::serve(listener, app).await?;

        Ok(())
    }
}
