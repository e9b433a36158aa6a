//! Error types for eventship-core

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the eventship-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration key, or inconsistent source selection
    #[error("configuration error: {0}")]
    Config(String),

    /// Client certificate, private key or CA bundle could not be loaded
    #[error("credential error: {0}")]
    Credential(String),

    /// Malformed HSM object identifier
    #[error("invalid identifier {id:?}: {reason}")]
    InvalidIdentifier { id: String, reason: &'static str },

    /// The collector could not be reached
    #[error("network error: {0}")]
    Network(String),

    /// The collector answered with a status other than 200/201
    #[error("server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    /// A spool entry could not be listed, read or removed
    #[error("filesystem error on {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Fatal errors stop the agent before the upload loop starts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Credential(_) | Error::InvalidIdentifier { .. }
        )
    }

    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::FileSystem {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for eventship-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Config("x".into()).is_fatal());
        assert!(Error::Credential("x".into()).is_fatal());
        assert!(Error::InvalidIdentifier {
            id: "0a".into(),
            reason: "not a digit"
        }
        .is_fatal());

        assert!(!Error::Network("timeout".into()).is_fatal());
        assert!(!Error::Server {
            status: 500,
            body: "boom".into()
        }
        .is_fatal());
        let denied = Error::fs("/tmp/x", std::io::Error::other("denied"));
        assert!(!denied.is_fatal());
    }

    #[test]
    fn test_server_error_message_includes_body() {
        let err = Error::Server {
            status: 503,
            body: "maintenance".into(),
        };
        assert_eq!(err.to_string(), "server error (HTTP 503): maintenance");
    }
}
