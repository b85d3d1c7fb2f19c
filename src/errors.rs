use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (self.status, self.message).into_response()
    }
}

/// Failures raised by a key/value storage tier.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("quota exceeded: need {needed} bytes, limit is {limit}")]
    QuotaExceeded { needed: usize, limit: usize },

    #[error("failed to encode store contents: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures seen by the stats cache before they are collapsed into
/// "absent" or "no-op" at the public boundary.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("malformed entry under {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("entry under {key} expired {age_ms}ms after fetch")]
    Expired { key: String, age_ms: i64 },

    #[error("failed to encode entry: {0}")]
    Encode(#[source] serde_json::Error),
}
