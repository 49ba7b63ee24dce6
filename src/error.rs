use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// Taken from https://github.com/tokio-rs/axum/blob/main/examples/anyhow-error-response/src/main.rs
#[derive(Debug)]
pub struct ChatRunnerError {
    pub status: StatusCode,
    pub message: HttpErrorResponse,
}

#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    error: String,
}

impl From<String> for HttpErrorResponse {
    fn from(message: String) -> Self {
        HttpErrorResponse { error: message }
    }
}

impl From<&str> for HttpErrorResponse {
    fn from(message: &str) -> Self {
        HttpErrorResponse {
            error: message.to_string(),
        }
    }
}

impl ChatRunnerError {
    pub fn new(status: StatusCode, message: impl Into<HttpErrorResponse>) -> Self {
        ChatRunnerError {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ChatRunnerError {
    fn into_response(self) -> Response {
        let mut res = Json(self.message).into_response();
        *res.status_mut() = self.status;
        res
    }
}

/// Anything that is not an explicit client error ends up as a 500 carrying the raw error text.
impl<E> From<E> for ChatRunnerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        ChatRunnerError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: HttpErrorResponse::from(format!(
                "Internal server error: {:#}",
                err.into()
            )),
        }
    }
}

pub type ChatResult<T, E = ChatRunnerError> = Result<T, E>;

#[macro_export]
macro_rules! bail_runner {
    ($error_message:expr) => {
        return Err($crate::error::ChatRunnerError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            $error_message,
        ))
    };
    ($status_code:expr, $error_message:expr) => {
        return Err($crate::error::ChatRunnerError::new($status_code, $error_message))
    };
    ($status:expr, $fmt:expr $(, $arg:expr)*) => {
        return Err($crate::error::ChatRunnerError::new($status, format!($fmt $(, $arg)*)))
    };
}
