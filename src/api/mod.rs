use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ChatRunnerError;
use crate::inference::host::ModelHost;

pub(crate) mod chat;
pub(crate) mod health;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) host: Arc<ModelHost>,
    pub(crate) max_length_ceiling: usize,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/health",
            get(health::handle_health).fallback(handle_method_not_allowed),
        )
        .route(
            "/chat",
            post(chat::handle_chat).fallback(handle_method_not_allowed),
        )
        .fallback(handle_not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_not_found() -> ChatRunnerError {
    ChatRunnerError::new(StatusCode::NOT_FOUND, "Endpoint not found")
}

async fn handle_method_not_allowed() -> ChatRunnerError {
    ChatRunnerError::new(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}
