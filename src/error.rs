use std::{net::IpAddr, time::Duration};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid or missing API key")]
    Unauthorized,
    #[error("origin not whitelisted")]
    OriginRejected(Option<IpAddr>),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("prompt must not be empty")]
    EmptyPrompt,
    /// `reason` is for the server log only.
    #[error("model `{model}` is unavailable")]
    ModelUnavailable { model: String, reason: String },
    #[error("generation timed out after {}s", .0.as_secs())]
    GenerationTimeout(Duration),
    #[error("model execution failed: {0}")]
    Backend(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::OriginRejected(_) => StatusCode::FORBIDDEN,
            ServiceError::BadRequest(_) | ServiceError::EmptyPrompt => StatusCode::BAD_REQUEST,
            ServiceError::ModelUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::GenerationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Backend(_) | ServiceError::Config(_) | ServiceError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message returned to the caller. Runtime failures are reported generically;
    /// their detail only goes to the server log.
    pub fn public_message(&self) -> String {
        match self {
            ServiceError::Backend(_) => "generation failed".to_string(),
            ServiceError::Config(_) | ServiceError::Io(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            ServiceError::Unauthorized => tracing::warn!(%status, "rejected: api key"),
            ServiceError::OriginRejected(peer) => {
                tracing::warn!(%status, peer = ?peer, "rejected: origin")
            }
            ServiceError::BadRequest(_) | ServiceError::EmptyPrompt => {
                tracing::warn!(%status, error = %self, "rejected: validation")
            }
            ServiceError::ModelUnavailable { reason, .. } => {
                tracing::error!(%status, error = %self, %reason, "request failed")
            }
            ServiceError::GenerationTimeout(_) => {
                tracing::error!(%status, error = %self, "request failed")
            }
            ServiceError::Backend(_) | ServiceError::Config(_) | ServiceError::Io(_) => {
                tracing::error!(%status, error = ?self, "request failed")
            }
        }

        let body = serde_json::json!({
            "error": self.public_message(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_detail_is_not_exposed() {
        let err = ServiceError::Backend("CUDA out of memory at 0x7f00".into());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "generation failed");
    }

    #[test]
    fn unavailable_reason_stays_in_the_log() {
        let err = ServiceError::ModelUnavailable {
            model: "gemma".into(),
            reason: "no such file: /srv/models/gemma/model.ts".into(),
        };
        assert_eq!(err.public_message(), "model `gemma` is unavailable");
    }

    #[test]
    fn statuses_follow_the_error_table() {
        assert_eq!(ServiceError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ServiceError::OriginRejected(None).status(), StatusCode::FORBIDDEN);
        assert_eq!(ServiceError::EmptyPrompt.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServiceError::ModelUnavailable {
                model: "gemma".into(),
                reason: "weights missing".into(),
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServiceError::GenerationTimeout(Duration::from_secs(5)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
