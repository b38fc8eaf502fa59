//! Axum read API for KNB.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use knb_storage::NoticeQuery;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

pub const CRATE_NAME: &str = "knb-web";

#[derive(Clone)]
pub struct AppState {
    pub notices: NoticeQuery,
}

impl AppState {
    pub fn new(notices: NoticeQuery) -> Self {
        Self { notices }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/notices", get(list_notices_handler))
        .layer(build_cors())
        .with_state(Arc::new(state))
}

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving notice API");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn list_notices_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.notices.list_recent().await {
        Ok(notices) => Json(notices).into_response(),
        Err(err) => {
            error!(error = %err, "listing notices failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "failed to load notices" })),
            )
                .into_response()
        }
    }
}
