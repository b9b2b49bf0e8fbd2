//! Common error types for the case vault.

use thiserror::Error;

/// Top-level error type for vault operations.
///
/// Messages never carry passwords, key material, or plaintext.
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong password: the derived verification token did not match.
    #[error("Authentication failed: invalid password")]
    Authentication,

    /// Authentication tag or content hash mismatch. Content is never released.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Access attempted after the idle timeout elapsed.
    #[error("Session expired; unlock the vault again")]
    SessionExpired,

    /// No session is active.
    #[error("Vault is locked")]
    Locked,

    /// A previous migration did not complete and must be resumed or rolled back.
    #[error("Migration interrupted: {0}")]
    MigrationInterrupted(String),

    /// The running operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Cryptographic primitive misuse (bad key length, invalid parameters).
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Vault operation failed.
    #[error("Vault error: {0}")]
    Vault(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Another owner holds the vault.
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Coarse classification of [`Error`], stable for callers that branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    Integrity,
    SessionExpired,
    Locked,
    MigrationInterrupted,
    Cancelled,
    Io,
    Other,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Authentication => ErrorKind::Authentication,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::SessionExpired => ErrorKind::SessionExpired,
            Error::Locked => ErrorKind::Locked,
            Error::MigrationInterrupted(_) => ErrorKind::MigrationInterrupted,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_) => ErrorKind::Io,
            _ => ErrorKind::Other,
        }
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Only transient filesystem failures qualify. Authentication and
    /// integrity failures are never retried.
    pub fn is_retryable(&self) -> bool {
        use std::io::ErrorKind as Io;
        match self {
            Error::Io(e) => !matches!(
                e.kind(),
                Io::NotFound
                    | Io::PermissionDenied
                    | Io::AlreadyExists
                    | Io::InvalidInput
                    | Io::InvalidData
                    | Io::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::Authentication.kind(), ErrorKind::Authentication);
        assert_eq!(
            Error::Integrity("tag".into()).kind(),
            ErrorKind::Integrity
        );
        assert_eq!(Error::SessionExpired.kind(), ErrorKind::SessionExpired);
        assert_eq!(
            Error::Conflict("held".into()).kind(),
            ErrorKind::Other
        );
    }

    #[test]
    fn test_only_transient_io_is_retryable() {
        let transient = Error::Io(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "interrupted",
        ));
        assert!(transient.is_retryable());

        let missing = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!missing.is_retryable());

        assert!(!Error::Authentication.is_retryable());
        assert!(!Error::Integrity("bad tag".into()).is_retryable());
    }

    #[test]
    fn test_messages_are_generic() {
        let msg = Error::Authentication.to_string();
        assert_eq!(msg, "Authentication failed: invalid password");
    }
}
