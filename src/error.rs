use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CuspakError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Input file not found or not readable: {0}")]
    MissingInput(PathBuf),

    #[error("Duplicate entry path in container: {0}")]
    DuplicatePath(String),

    #[error("Invalid chunk size: {0}. Must be between 4KB and 16MB")]
    InvalidChunkSize(u32),

    #[error("Invalid entry path: {0}")]
    InvalidEntryPath(String),

    #[error("Not a cuspak container")]
    NotAContainer,

    #[error("Unsupported container version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Header corrupted: {0}")]
    HeaderCorrupted(String),

    #[error("Secret required: container header is encrypted")]
    SecretRequired,

    // Deliberately opaque: wrong key and tampered header are indistinguishable
    #[error("Header authentication failed")]
    AuthenticationFailed,

    #[error("Container checksum mismatch")]
    TrailerMismatch,

    #[error("Incomplete payload for {path}: expected {expected} bytes, got {got}")]
    IncompletePayload {
        path: String,
        expected: u64,
        got: u64,
    },

    #[error("Block {index} of {path} has no physical copy in the container")]
    MissingBlock { path: String, index: usize },

    #[error("Payload corrupted: {0}")]
    PayloadCorrupted(String),

    #[error("Content hash mismatch for extracted file: {0}")]
    ContentHashMismatch(String),

    #[error("{} file(s) could not be recovered: {}", .0.len(), .0.join(", "))]
    FilesUnrecoverable(Vec<String>),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse failure classification, one bucket per family of causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad caller input, rejected before anything is written
    Input,
    /// The bytes on disk are not a container this version understands
    Format,
    /// Wrong key or tampered header (indistinguishable on purpose)
    Authentication,
    /// The container parsed but its contents failed verification
    Integrity,
    /// The operating system refused us
    Resource,
    /// Cooperative cancellation
    Cancelled,
}

impl CuspakError {
    pub fn kind(&self) -> ErrorKind {
        use CuspakError::*;
        match self {
            MissingInput(_) | DuplicatePath(_) | InvalidChunkSize(_) | InvalidEntryPath(_) => {
                ErrorKind::Input
            }
            NotAContainer
            | UnsupportedVersion(_)
            | UnsupportedAlgorithm(_)
            | HeaderCorrupted(_)
            | SecretRequired
            | Json(_) => ErrorKind::Format,
            AuthenticationFailed => ErrorKind::Authentication,
            TrailerMismatch
            | IncompletePayload { .. }
            | MissingBlock { .. }
            | PayloadCorrupted(_)
            | ContentHashMismatch(_)
            | FilesUnrecoverable(_) => ErrorKind::Integrity,
            Io(_) => ErrorKind::Resource,
            Cancelled => ErrorKind::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, CuspakError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            CuspakError::DuplicatePath("a".into()).kind(),
            ErrorKind::Input
        );
        assert_eq!(CuspakError::NotAContainer.kind(), ErrorKind::Format);
        assert_eq!(
            CuspakError::AuthenticationFailed.kind(),
            ErrorKind::Authentication
        );
        assert_eq!(CuspakError::TrailerMismatch.kind(), ErrorKind::Integrity);
        assert_eq!(CuspakError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_authentication_message_is_opaque() {
        // Must not leak whether the key was wrong or the data tampered
        let msg = CuspakError::AuthenticationFailed.to_string();
        assert!(!msg.to_lowercase().contains("wrong"));
        assert!(!msg.to_lowercase().contains("tamper"));
    }
}
