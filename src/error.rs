//! Error taxonomy for the RAG core.
//!
//! Library code returns [`RagError`]; the binary and `AppState` setup use
//! `anyhow` for startup failures.

use axum::http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Bad chunk parameters, unknown model, dimension mismatch.
    #[error("config error: {0}")]
    Config(String),

    /// Embedding or completion provider failure.
    #[error("provider error: {message}")]
    Provider { message: String, transient: bool },

    /// A single malformed stream frame. Never fatal to a turn.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authorized: {0}")]
    Authorization(String),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// A provider failure worth retrying (network hiccup, 429, 5xx).
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
            transient: true,
        }
    }

    /// A provider failure that will not succeed on retry.
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider { transient: true, .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::Provider { .. } => StatusCode::BAD_GATEWAY,
            Self::Decode(_) | Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Map a core error into the `(StatusCode, String)` shape the handlers return.
pub fn api_error(err: RagError) -> (StatusCode, String) {
    (err.status_code(), err.to_string())
}

impl From<reqwest::Error> for RagError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Self::transient(e.to_string())
        } else {
            Self::terminal(e.to_string())
        }
    }
}
