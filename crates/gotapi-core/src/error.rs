use gotapi_types::{ErrorKind, Reply};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Message channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Protocol-level failure reported to an app as a reply with `result != 0`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} ({status}): {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
}

impl GatewayError {
    /// Failure with the kind's default status.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: kind.status(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_status(kind: ErrorKind, status: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameter, message)
    }

    /// A required query or frame parameter is missing.
    #[must_use]
    pub fn missing_parameter(name: &str) -> Self {
        Self::invalid_parameter(format!("The parameter \"{name}\" is required."))
    }

    #[must_use]
    pub fn not_authorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAuthorized, message)
    }

    #[must_use]
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidToken, message)
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Error, message)
    }
}

impl From<GatewayError> for Reply {
    fn from(err: GatewayError) -> Self {
        Reply::error(err.kind, err.status, err.message)
    }
}
