//! Error types shared by every layer of the ingress engine.

use thiserror::Error;

/// Errors raised by dynamos, the firewall and the engine.
///
/// The error is `Clone` so that a single shutdown or abort outcome can be
/// handed to every caller awaiting it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngressError {
    /// An internal invariant was violated.
    #[error("An internal assertion failed.")]
    AssertionFailed,

    /// The arguments were invalid.
    #[error("Bad arguments: {0}")]
    BadArguments(String),

    /// A persisted entity cannot be decoded by this engine.
    #[error("{context}")]
    EngineVersionMismatch { context: String },

    /// The entity has already been shut down.
    #[error("The requested entity is no longer processing.")]
    NotProcessing,

    /// The operation is not supported.
    #[error("The requested operation is not supported.")]
    NotSupported,

    /// A required file of a document package is missing.
    #[error("The repository resource '{0}' was not found.")]
    RepoResourceNotFound(String),

    /// A file of a document package is malformed.
    #[error("The repository resource '{name}' is invalid: {message}")]
    RepoResourceInvalid { name: String, message: String },

    /// An I/O error, captured as text.
    #[error("io error: {0}")]
    Io(String),

    /// A JSON encoding or decoding error, captured as text.
    #[error("json error: {0}")]
    Json(String),
}

impl IngressError {
    /// Build an [`IngressError::EngineVersionMismatch`] for an unknown type tag.
    pub fn unsupported_type(type_id: &str) -> Self {
        Self::EngineVersionMismatch {
            context: format!("The dynamo type '{type_id}' is not supported by this engine."),
        }
    }

    /// Build an [`IngressError::RepoResourceInvalid`].
    pub fn invalid_resource(name: impl Into<String>, message: impl ToString) -> Self {
        Self::RepoResourceInvalid {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for IngressError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for IngressError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type alias for ingress operations.
pub type Result<T> = std::result::Result<T, IngressError>;

/// The outcome of shutting down a processing entity.
pub type ShutdownResult = Result<()>;

/// Combining shutdown outcomes of several children.
pub trait ShutdownResultExt {
    /// Fold `other` into `self`, keeping the first failure seen.
    fn append(&mut self, other: ShutdownResult);
}

impl ShutdownResultExt for ShutdownResult {
    fn append(&mut self, other: ShutdownResult) {
        if self.is_ok() {
            *self = other;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            IngressError::NotProcessing.to_string(),
            "The requested entity is no longer processing."
        );
        assert_eq!(
            IngressError::unsupported_type("trigger.ftp").to_string(),
            "The dynamo type 'trigger.ftp' is not supported by this engine."
        );
        assert_eq!(
            IngressError::RepoResourceNotFound("manifest.json".into()).to_string(),
            "The repository resource 'manifest.json' was not found."
        );
    }

    #[test]
    fn io_error_converts() {
        let err: IngressError =
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use").into();
        assert_eq!(err, IngressError::Io("address in use".into()));
    }

    #[test]
    fn shutdown_append_keeps_first_failure() {
        let mut result: ShutdownResult = Ok(());
        result.append(Ok(()));
        assert!(result.is_ok());

        result.append(Err(IngressError::NotProcessing));
        result.append(Err(IngressError::AssertionFailed));
        assert_eq!(result, Err(IngressError::NotProcessing));

        result.append(Ok(()));
        assert_eq!(result, Err(IngressError::NotProcessing));
    }
}
