//! Error types and their HTTP mapping.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures that reject a request before anything is forwarded.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("request body is not valid JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("request body must be a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid request: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),

    #[error("payload nesting exceeds the limit of {limit} levels")]
    DepthExceeded { limit: usize },

    #[error("failed to encode normalized request: {0}")]
    Encode(#[source] serde_json::Error),
}

impl PipelineError {
    /// Machine-readable reason returned to the client.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedJson(_) => "malformed_json",
            Self::NotAnObject => "invalid_body",
            Self::MissingField(_) => "missing_field",
            Self::InvalidEnvelope(_) => "invalid_request",
            Self::DepthExceeded { .. } => "payload_too_deep",
            Self::Encode(_) => "encode_failed",
        }
    }
}

/// Failures talking to the backend.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("backend unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),

    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),

    #[error("failed to read backend response: {0}")]
    Read(#[source] reqwest::Error),

    #[error("failed to build backend client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Every error a request handler can return.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl ProxyError {
    fn code(&self) -> &'static str {
        match self {
            Self::Pipeline(e) => e.code(),
            Self::Gateway(GatewayError::Timeout(_)) => "backend_timeout",
            Self::Gateway(_) => "backend_unavailable",
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Pipeline(PipelineError::Encode(_)) => "api_error",
            Self::Pipeline(_) => "invalid_request_error",
            Self::Gateway(_) => "api_error",
        }
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Pipeline(PipelineError::Encode(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Pipeline(_) => StatusCode::BAD_REQUEST,
            Self::Gateway(GatewayError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::Gateway(GatewayError::Unreachable(e)) if e.is_timeout() => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::Gateway(GatewayError::Client(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Gateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
                "code": self.code(),
                "message": self.to_string(),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_are_client_errors() {
        let err = ProxyError::from(PipelineError::DepthExceeded { limit: 64 });
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "payload_too_deep");

        let err = ProxyError::from(PipelineError::MissingField("messages"));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "missing required field `messages`");
    }

    #[test]
    fn timeouts_map_to_gateway_timeout() {
        let err = ProxyError::from(GatewayError::Timeout(Duration::from_secs(5)));
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.code(), "backend_timeout");
    }
}
