use axum::http::StatusCode;
use thiserror::Error;

/// Failure taxonomy shared by the controller, the lifecycle and the HTTP layer.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Pipeline or tokenizer not installed yet. Retryable.
    #[error("model not ready")]
    NotReady,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("model load failed: {0:#}")]
    Load(#[source] anyhow::Error),

    #[error("generation failed: {0:#}")]
    Generation(#[source] anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DecodeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Load(_) | Self::Generation(_) | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady)
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_status() {
        assert_eq!(DecodeError::NotReady.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            DecodeError::validation("Prompt is required").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DecodeError::Generation(anyhow::anyhow!("kernel fault")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(DecodeError::NotReady.is_retryable());
        assert!(!DecodeError::validation("x").is_retryable());
    }

    #[test]
    fn generation_error_keeps_underlying_cause() {
        let err = DecodeError::Generation(anyhow::anyhow!("step failed").context("decode step 3"));
        let text = err.to_string();
        assert!(text.contains("decode step 3"));
        assert!(text.contains("step failed"));
    }
}
