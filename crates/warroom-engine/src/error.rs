use warroom_store::StoreError;

/// Classified failures of the session coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no unused session code after {0} attempts")]
    CodeExhausted(u32),

    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl CoordinatorError {
    /// Short classification string for logging and RPC error codes.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::StateConflict(_) => "state_conflict",
            Self::InvalidRequest(_) => "invalid_request",
            Self::CodeExhausted(_) => "code_exhausted",
            Self::Storage(_) => "storage",
        }
    }

    /// Whether the caller did something wrong, as opposed to the system failing.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Unauthorized(_) | Self::StateConflict(_) | Self::InvalidRequest(_)
        )
    }
}
