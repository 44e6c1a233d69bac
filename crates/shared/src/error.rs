use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The backend refused the operation (bad credentials, existing account,
    /// weak password, ...). The message is the backend's own description and
    /// is shown to the user as-is.
    #[error("{message}")]
    Rejected { message: String },
    #[error("identity backend unreachable: {0}")]
    Transport(String),
    #[error("malformed identity backend response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store rejected credentials: {0}")]
    Unauthorized(String),
    #[error("store unreachable: {0}")]
    Transport(String),
    #[error("malformed store payload: {0}")]
    InvalidResponse(String),
}
