//! HTTP API: OpenAI-style routes under `api_prefix` plus `/health`.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::{Config, ServerConfig};
use crate::error::AppError;
use crate::models::Models;

use error::ApiError;

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub models: Arc<Models>,
}

/// Build the router: API routes (behind auth when keys are configured),
/// unprefixed `/health`, permissive CORS.
pub fn router(state: AppState) -> Router {
    let mut api = Router::new()
        .route("/models", get(handlers::list_models))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/completions", post(handlers::completions))
        .route("/embeddings", post(handlers::embeddings))
        .route("/rerank", post(handlers::rerank));

    if !state.config.api_keys.is_empty() {
        api = api.route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));
    }

    let prefix = state.config.server.api_prefix.as_str();
    let app = if prefix.is_empty() {
        Router::new().merge(api)
    } else {
        Router::new().nest(prefix, api)
    };

    app.route("/health", get(handlers::health))
        // Mirrors the request origin so credentials stay allowed.
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(key) if state.config.api_keys.iter().any(|k| k == key) => next.run(req).await,
        Some(_) => ApiError::unauthorized("invalid API key").into_response(),
        None => ApiError::unauthorized("missing bearer token").into_response(),
    }
}

/// Serve `app` until `shutdown` is cancelled, then drain in-flight requests.
pub async fn serve(
    app: Router,
    server: &ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let bind_addr = server.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| AppError::Server(format!("bind failed on {bind_addr}: {e}")))?;

    info!(%bind_addr, prefix = %server.api_prefix, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| AppError::Server(format!("http server failed: {e}")))?;

    info!("http server stopped");
    Ok(())
}
