use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("No worker has capacity for this request")]
    CapacityExhausted,

    /// Another caller reserved the worker between selection and the busy transition
    #[error("Worker {0} was reserved by another request")]
    Contended(String),

    #[error("Worker {worker_id} request failed: {reason}")]
    TransientWorker { worker_id: String, reason: String },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            FleetError::Validation(_) => StatusCode::BAD_REQUEST,
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
            FleetError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            FleetError::Conflict(_) => StatusCode::CONFLICT,
            FleetError::CapacityExhausted | FleetError::Contended(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            FleetError::TransientWorker { .. } => StatusCode::BAD_GATEWAY,
            FleetError::Signing(_)
            | FleetError::Config(_)
            | FleetError::Storage(_)
            | FleetError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for API consumers
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::Validation(_) => "INVALID_INPUT",
            FleetError::NotFound(_) => "NOT_FOUND",
            FleetError::Unauthorized(_) => "UNAUTHORIZED",
            FleetError::Conflict(_) => "CONFLICT",
            FleetError::CapacityExhausted | FleetError::Contended(_) => "NO_WORKERS_AVAILABLE",
            FleetError::TransientWorker { .. } => "GENERATION_FAILED",
            FleetError::Signing(_) => "SIGNING_FAILED",
            FleetError::Config(_) | FleetError::Storage(_) | FleetError::Serialization(_) => {
                "SERVER_ERROR"
            }
        }
    }
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal details stay in the logs
        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self, "Request failed");
            match &self {
                FleetError::TransientWorker { .. } => "Generation failed on the selected worker".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };
        let body = json!({
            "success": false,
            "error": { "code": self.code(), "message": message },
        });
        (status, Json(body)).into_response()
    }
}
