//! Error types for the distributed cache engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug, Clone)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Topology / Node Errors
    // =========================================================================
    /// Not enough nodes to satisfy the replication factor
    #[error("Insufficient nodes in topology: have {available}, need {required}")]
    Topology { available: usize, required: usize },

    /// Node breaker is open, call rejected without touching the network
    #[error("Circuit open for node {node_id}")]
    CircuitOpen { node_id: String },

    /// Node could not be reached (connection error, closed pool, backend fault)
    #[error("Node {node_id} unavailable: {reason}")]
    NodeUnavailable { node_id: String, reason: String },

    /// Node is not part of the current topology
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Operation deadline exceeded
    #[error("Operation {operation} timed out after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// Fewer than the required number of replicas acknowledged
    #[error("Quorum not reached: {acks} of {required} required acknowledgements")]
    QuorumNotReached { acks: usize, required: usize },

    // =========================================================================
    // Payload Errors
    // =========================================================================
    /// Value could not be (de)serialized or the record envelope is malformed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Encryption or decryption failed (wrong or rotated key)
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Stored checksum does not match payload
    #[error("Integrity check failed for key {key}")]
    Integrity { key: String },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Input / Configuration Errors
    // =========================================================================
    /// Caller supplied an invalid key, ttl or value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// I/O error (backup files, config files)
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `NodeUnavailable` error
    pub fn unavailable(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::NodeUnavailable {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error counts against a node's circuit breaker
    pub fn is_node_fault(&self) -> bool {
        matches!(self, Error::NodeUnavailable { .. } | Error::Timeout { .. })
    }

    /// Whether this error concerns the payload rather than the node.
    ///
    /// Payload errors are never retried against the same node.
    pub fn is_payload_error(&self) -> bool {
        matches!(
            self,
            Error::Serialization(_)
                | Error::Encryption(_)
                | Error::Integrity { .. }
                | Error::DecompressionFailed { .. }
        )
    }

    /// Whether the caller may reasonably retry later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen { .. }
                | Error::NodeUnavailable { .. }
                | Error::Timeout { .. }
                | Error::QuorumNotReached { .. }
                | Error::Topology { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_fault_classification() {
        assert!(Error::unavailable("a", "refused").is_node_fault());
        assert!(Error::Timeout {
            operation: "get".into(),
            elapsed: Duration::from_millis(5)
        }
        .is_node_fault());
        assert!(!Error::Integrity { key: "k".into() }.is_node_fault());
        assert!(!Error::CircuitOpen { node_id: "a".into() }.is_node_fault());
    }

    #[test]
    fn test_payload_errors_not_retryable() {
        let err = Error::Encryption("unknown key version 3".into());
        assert!(err.is_payload_error());
        assert!(!err.is_retryable());

        let err = Error::QuorumNotReached {
            acks: 1,
            required: 2,
        };
        assert!(!err.is_payload_error());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Topology {
            available: 1,
            required: 2,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient nodes in topology: have 1, need 2"
        );
    }
}
