use thiserror::Error;

/// Shared error taxonomy for the hub, permission manager, and gateway.
///
/// Negative permission answers are normal outcomes and are returned as plain
/// booleans or decline results, not errors; these variants cover malformed
/// input, missing identifiers, protected targets, and transport failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("protected resource: {0}")]
    ProtectedResource(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
