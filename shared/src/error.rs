use serde::{Serialize, Deserialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable error class carried in every API error body.
#[derive(Debug, Clone, Copy, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    #[error("Invalid input provided")]
    InvalidInput,
    #[error("Invalid option")]
    InvalidOption,
    #[error("Resource not found")]
    NotFound,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Access denied")]
    Forbidden,
    #[error("Already voted")]
    AlreadyVoted,
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Internal system error")]
    SystemError,
}

impl ErrorCode {
    /// HTTP status code a response carrying this error class is sent with.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::InvalidInput | ErrorCode::InvalidOption => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::AlreadyVoted => 409,
            ErrorCode::RateLimited => 429,
            ErrorCode::SystemError => 500,
        }
    }
}

/// Body of every non-2xx API response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}: {} ({details})", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: Some(details.into()) }
    }

    /// Generic server failure. The cause goes to the log, not to the client.
    pub fn internal() -> Self {
        Self::new(ErrorCode::SystemError, "Internal server error")
    }
}
