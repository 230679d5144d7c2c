use serde::Serialize;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure raised by a model backend, before or during streaming.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("context overflow: {0}")]
    ContextOverflow(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    /// Absent and not-owned are deliberately the same error.
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("internal error: {0}")]
    Internal(#[source] BoxError),
}

/// Structured error object returned outside of a stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorBody {
    pub status: u16,
    pub detail: String,
}

impl EngineError {
    pub fn validation(detail: impl Into<String>) -> Self {
        EngineError::Validation(detail.into())
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        EngineError::NotFound(detail.into())
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        EngineError::Conflict(detail.into())
    }

    pub fn internal(err: impl Into<BoxError>) -> Self {
        EngineError::Internal(err.into())
    }

    /// HTTP-style status category.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::Validation(_) => 400,
            EngineError::NotFound(_) => 404,
            EngineError::Conflict(_) => 409,
            EngineError::ContextOverflow(_) => 413,
            EngineError::Generation(_) => 502,
            EngineError::Internal(_) => 500,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            status: self.status(),
            detail: self.to_string(),
        }
    }
}

impl From<eyre::Report> for EngineError {
    fn from(err: eyre::Report) -> Self {
        EngineError::Internal(err.into())
    }
}

impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Generation(msg) => EngineError::Generation(msg),
            BackendError::ContextOverflow(msg) => EngineError::ContextOverflow(msg),
        }
    }
}
