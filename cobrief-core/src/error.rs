//! Error taxonomy shared by every collaboration component.

use thiserror::Error;

/// Errors raised by the collaboration core.
///
/// Merge conflicts never appear here: the mergeable document resolves them
/// and the engine only counts them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    /// Transient transport failure. Retried on the next heartbeat or publish.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("no active session")]
    AuthenticationMissing,

    /// A stored comment anchor no longer matches the document text.
    #[error("comment anchor drifted from document content")]
    ContentDrift,

    /// A text node for a range boundary could not be located.
    #[error("range could not be located in rendered text")]
    RangeResolutionFailure,

    #[error("crdt error: {0}")]
    Crdt(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("no document is open")]
    DocumentNotOpen,
}

impl CollabError {
    /// Transient errors are retried by the next scheduled cycle instead of
    /// being surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, CollabError::NetworkFailure(_))
    }
}

impl From<automerge::AutomergeError> for CollabError {
    fn from(e: automerge::AutomergeError) -> Self {
        CollabError::Crdt(e.to_string())
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        CollabError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_failures_are_transient() {
        assert!(CollabError::NetworkFailure("timeout".into()).is_transient());
        assert!(!CollabError::AuthenticationMissing.is_transient());
        assert!(!CollabError::ContentDrift.is_transient());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            CollabError::NetworkFailure("reset".into()).to_string(),
            "network failure: reset"
        );
        assert_eq!(CollabError::AuthenticationMissing.to_string(), "no active session");
    }
}
