use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use crate::api::AppState;
use crate::bail_runner;
use crate::error::ChatResult;
use crate::inference::model_config::{
    SamplingParams, DEFAULT_MAX_LENGTH, DEFAULT_TEMPERATURE, DEFAULT_TOP_P,
};

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Missing 'message' field in request body")]
    MissingMessage,
    #[error("Message must be a non-empty string")]
    EmptyMessage,
    #[error("Temperature must be between 0 and 2.0")]
    Temperature,
    #[error("top_p must be between 0 and 1.0")]
    TopP,
    #[error("max_length must be an integer between 1 and {0}")]
    MaxLength(usize),
}

/// A chat request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatParams {
    pub message: String,
    pub sampling: SamplingParams,
}

impl ChatParams {
    /// Checks run in order and the first failure is reported.
    pub fn from_body(body: &[u8], max_length_ceiling: usize) -> Result<Self, ValidationError> {
        let fields = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => fields,
            _ => return Err(ValidationError::MissingMessage),
        };

        let message = match fields.get("message") {
            None => return Err(ValidationError::MissingMessage),
            Some(Value::String(message)) if !message.trim().is_empty() => message.clone(),
            Some(_) => return Err(ValidationError::EmptyMessage),
        };

        let temperature = bounded_float(&fields, "temperature", DEFAULT_TEMPERATURE, 2.0)
            .ok_or(ValidationError::Temperature)?;
        let top_p =
            bounded_float(&fields, "top_p", DEFAULT_TOP_P, 1.0).ok_or(ValidationError::TopP)?;

        let max_length = match fields.get("max_length") {
            None => DEFAULT_MAX_LENGTH,
            Some(value) => value
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| (1..=max_length_ceiling).contains(n))
                .ok_or(ValidationError::MaxLength(max_length_ceiling))?,
        };

        Ok(ChatParams {
            message,
            sampling: SamplingParams {
                max_length,
                temperature,
                top_p,
            },
        })
    }
}

/// `default` when absent, `None` unless the value is a number in `(0, max]`.
fn bounded_float(fields: &Map<String, Value>, key: &str, default: f64, max: f64) -> Option<f64> {
    match fields.get(key) {
        None => Some(default),
        Some(value) => value.as_f64().filter(|v| *v > 0.0 && *v <= max),
    }
}

#[derive(Serialize, Debug)]
pub struct ChatResponse {
    pub response: String,
    pub generation_time: f64,
    pub model: String,
    pub parameters: SamplingParams,
}

fn round_secs(secs: f64) -> f64 {
    (secs * 100.0).round() / 100.0
}

#[axum_macros::debug_handler]
pub(crate) async fn handle_chat(
    State(state): State<AppState>,
    body: Bytes,
) -> ChatResult<Json<ChatResponse>> {
    let params = match ChatParams::from_body(&body, state.max_length_ceiling) {
        Ok(params) => params,
        Err(err) => bail_runner!(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let start = Instant::now();
    let response = state.host.generate(&params.message, params.sampling).await?;
    let generation_time = round_secs(start.elapsed().as_secs_f64());
    info!("Generated {} characters in {}s", response.len(), generation_time);

    Ok(Json(ChatResponse {
        response,
        generation_time,
        model: state.host.model_id().to_string(),
        parameters: params.sampling,
    }))
}
