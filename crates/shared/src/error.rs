use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error body returned by the generation server (`{"detail": ...}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub detail: Value,
}

impl ApiError {
    pub fn message(&self) -> String {
        match &self.detail {
            Value::String(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Error)]
#[error("server responded {status}: {message}")]
pub struct ApiException {
    pub status: u16,
    pub message: String,
}

impl ApiException {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Builds an exception from a raw response body, preferring the server's `detail` text.
    pub fn from_body(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<ApiError>(body)
            .map(|err| err.message())
            .unwrap_or_else(|_| body.trim().to_string());
        Self::new(status, message)
    }
}
