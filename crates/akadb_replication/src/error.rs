//! Error types for replication.

use akadb_core::{CoreError, NodeId};
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur while propagating changes.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The destination refused or failed to apply a change.
    #[error("apply on {node} failed: {source}")]
    Apply {
        /// Destination node.
        node: NodeId,
        /// Underlying failure.
        #[source]
        source: CoreError,
    },

    /// The cluster the coordinator serves has been dropped.
    #[error("cluster is no longer available")]
    ClusterClosed,

    /// The node has no replication link.
    #[error("no replication link for {node}")]
    UnknownLink {
        /// Requested node.
        node: NodeId,
    },

    /// The coordinator is shutting down.
    #[error("replication is shutting down")]
    ShuttingDown,

    /// Workers need a tokio runtime to be spawned on.
    #[error("replication must be started inside a tokio runtime")]
    NoRuntime,

    /// Core error outside of an apply.
    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl ReplicationError {
    /// Wraps an apply failure.
    pub fn apply(node: NodeId, source: CoreError) -> Self {
        Self::Apply { node, source }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Apply { source, .. } => source.is_transient(),
            ReplicationError::Core(source) => source.is_transient(),
            ReplicationError::ClusterClosed
            | ReplicationError::UnknownLink { .. }
            | ReplicationError::ShuttingDown
            | ReplicationError::NoRuntime => false,
        }
    }
}
