//! Error types for AkaDB core.

use crate::record::RecordKey;
use crate::types::{NodeId, SequenceNumber, TransactionId};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in AkaDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record with the same key already exists on the node.
    #[error("duplicate key {key} on {node}")]
    DuplicateKey {
        /// Node where the insert was attempted.
        node: NodeId,
        /// The conflicting key.
        key: RecordKey,
    },

    /// The referenced record does not exist on the node.
    #[error("record {what} not found on {node}")]
    NotFound {
        /// Node that was searched.
        node: NodeId,
        /// Description of the missing key.
        what: String,
    },

    /// A serializable transaction lost a race with a concurrent one.
    #[error("serialization conflict on {key}: {txn} lost to a concurrent transaction")]
    SerializationConflict {
        /// The transaction that failed.
        txn: TransactionId,
        /// Key on which the conflict was detected.
        key: RecordKey,
    },

    /// Another open transaction holds the write lock on a key.
    #[error("write conflict on {key}: locked by {holder}")]
    WriteConflict {
        /// Key that is locked.
        key: RecordKey,
        /// Transaction holding the lock.
        holder: TransactionId,
    },

    /// The node is administratively offline.
    #[error("{node} is unavailable")]
    NodeUnavailable {
        /// The offline node.
        node: NodeId,
    },

    /// A replicated change arrived before an earlier change from its origin.
    #[error("replication gap from {origin}: expected {expected}, received {received}")]
    SequenceGap {
        /// Node the change originated on.
        origin: NodeId,
        /// Next origin sequence the receiver can apply.
        expected: SequenceNumber,
        /// Origin sequence of the change that arrived.
        received: SequenceNumber,
    },

    /// The node is not part of the cluster.
    #[error("unknown node: {node}")]
    UnknownNode {
        /// The requested node.
        node: NodeId,
    },

    /// A request was missing a required field or carried an invalid value.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the problem.
        message: String,
    },

    /// No open transaction has the given ID.
    #[error("transaction not found: {txn}")]
    TransactionNotFound {
        /// The requested transaction.
        txn: TransactionId,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Commit log I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Commit log entry could not be encoded or decoded.
    #[error("commit log encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(node: NodeId, what: impl Into<String>) -> Self {
        Self::NotFound {
            node,
            what: what.into(),
        }
    }

    /// Returns true if the failure forces the enclosing transaction to abort.
    pub fn aborts_transaction(&self) -> bool {
        matches!(
            self,
            CoreError::SerializationConflict { .. } | CoreError::NodeUnavailable { .. }
        )
    }

    /// Returns true for failures that may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::NodeUnavailable { .. }
                | CoreError::WriteConflict { .. }
                | CoreError::SerializationConflict { .. }
                | CoreError::SequenceGap { .. }
        )
    }

    /// Short name of the error kind, as used in request logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::DuplicateKey { .. } => "DuplicateKey",
            CoreError::NotFound { .. } => "NotFound",
            CoreError::SerializationConflict { .. } => "SerializationConflict",
            CoreError::WriteConflict { .. } => "WriteConflict",
            CoreError::NodeUnavailable { .. } => "NodeUnavailable",
            CoreError::SequenceGap { .. } => "SequenceGap",
            CoreError::UnknownNode { .. } => "UnknownNode",
            CoreError::Validation { .. } => "ValidationError",
            CoreError::TransactionNotFound { .. } => "TransactionNotFound",
            CoreError::InvalidOperation { .. } => "InvalidOperation",
            CoreError::Io(_) => "IoError",
            CoreError::Encoding(_) => "EncodingError",
        }
    }
}
