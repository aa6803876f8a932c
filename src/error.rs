//! Error types for KernelChain

use thiserror::Error;

/// Outcome of checking a parsed block against its predecessor.
///
/// The two mismatch variants are fork signals rather than faults: they tell
/// the synchronizer which replacement window to request from the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("previous block hash mismatch at block {block_id}")]
    HashMismatch { block_id: u64 },
    #[error("rollbacks hash mismatch at block {block_id}")]
    RollbackHashMismatch { block_id: u64 },
    #[error("invalid block {block_id}: {reason}")]
    Invalid { block_id: u64, reason: String },
}

impl VerifyError {
    /// Number of validly signed blocks fork repair must collect for this
    /// mismatch kind, or `None` if the error is not a fork signal.
    pub fn fork_window(&self) -> Option<usize> {
        match self {
            VerifyError::HashMismatch { .. } => Some(1),
            VerifyError::RollbackHashMismatch { .. } => Some(2),
            VerifyError::Invalid { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Not a recognized node: {0}")]
    NotANode(String),
    #[error("Not this node's turn: {0}")]
    NotMyTurn(String),
    #[error("No candidate nodes available")]
    NoCandidates,
    #[error("Chain is not initialized")]
    EmptyChain,
    #[error("Chain head moved: expected {expected}, found {found}")]
    HeadRace { expected: u64, found: u64 },
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Peer {0} timed out")]
    Timeout(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("Bad block from {host}: {reason}")]
    BadBlock { host: String, reason: String },
    #[error("Stale or replayed message: {0}")]
    StaleMessage(String),
    #[error("Fork not found: {0}")]
    ForkNotFound(String),
    #[error("Execution error: {0}")]
    ExecutionError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Metrics error: {0}")]
    MetricsError(String),
    #[error("Cancelled")]
    Cancelled,
}

impl ChainError {
    /// Expected outcomes that mean "nothing to do this tick". Jobs log them
    /// at debug level and return success.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ChainError::NotANode(_)
                | ChainError::NotMyTurn(_)
                | ChainError::NoCandidates
                | ChainError::EmptyChain
                | ChainError::Cancelled
        )
    }
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

impl From<hex::FromHexError> for ChainError {
    fn from(err: hex::FromHexError) -> Self {
        ChainError::CryptoError(format!("invalid hex: {}", err))
    }
}

impl From<prometheus::Error> for ChainError {
    fn from(err: prometheus::Error) -> Self {
        ChainError::MetricsError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fork_windows() {
        assert_eq!(VerifyError::HashMismatch { block_id: 5 }.fork_window(), Some(1));
        assert_eq!(
            VerifyError::RollbackHashMismatch { block_id: 5 }.fork_window(),
            Some(2)
        );
        let invalid = VerifyError::Invalid {
            block_id: 5,
            reason: "bad merkle root".to_string(),
        };
        assert_eq!(invalid.fork_window(), None);
    }

    #[test]
    fn test_expected_errors() {
        assert!(ChainError::NotANode("abc".to_string()).is_expected());
        assert!(ChainError::NoCandidates.is_expected());
        assert!(!ChainError::NetworkError("refused".to_string()).is_expected());
        assert!(!ChainError::HeadRace { expected: 1, found: 2 }.is_expected());
    }
}
