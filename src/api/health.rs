use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::AppState;

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
    pub device: String,
}

pub(crate) async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model_loaded: state.host.is_loaded(),
        device: state.host.device().to_string(),
    })
}
