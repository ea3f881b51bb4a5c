use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocketError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("unsupported expression: {0}")]
    UnsupportedExpression(String),
    #[error("document {id} of type '{document_type}' was updated by another session")]
    ConcurrencyConflict { id: i64, document_type: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DocketError {
    /// Wrap a failure raised by the storage collaborator without altering it.
    pub fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DocketError::Storage(Box::new(err))
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        DocketError::InvariantViolation(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        DocketError::UnsupportedExpression(msg.into())
    }

    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, DocketError::ConcurrencyConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, DocketError>;
