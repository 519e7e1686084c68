use thiserror::Error;

/// Convenience alias for `Result`s returned from anywhere in the engine.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Error taxonomy for the broker: every variant maps to exactly one of
/// `VALIDATION`, `NOT_FOUND`, `CONFLICT`, `PERMISSION`, `TIMEOUT`, `INTERNAL`
/// via [`BrokerError::code`]. The tool surface uses that code to build the
/// `[CODE] message` envelope text; no raw error ever crosses that boundary
/// unwrapped.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The six-member taxonomy from the design's error-handling section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    NotFound,
    Conflict,
    Permission,
    Timeout,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Permission => "PERMISSION",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl BrokerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::Validation(_) => ErrorCode::Validation,
            BrokerError::NotFound(_) => ErrorCode::NotFound,
            BrokerError::Conflict(_) => ErrorCode::Conflict,
            BrokerError::Permission(_) => ErrorCode::Permission,
            BrokerError::Timeout(_) => ErrorCode::Timeout,
            BrokerError::Internal(_) => ErrorCode::Internal,
            BrokerError::Configuration(_) => ErrorCode::Internal,
            BrokerError::Serialization(_) => ErrorCode::Internal,
        }
    }

    /// Renders the `[CODE] message` text the tool surface puts in the envelope.
    pub fn to_envelope_text(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}
