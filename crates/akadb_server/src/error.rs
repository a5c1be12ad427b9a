//! Error types for the server.

use akadb_core::CoreError;
use akadb_replication::ReplicationError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while serving a request.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed request line, headers, query, or body.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No route for the method and path.
    #[error("no route for {method} {path}")]
    RouteNotFound {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },

    /// Request body larger than allowed.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Configured limit.
        limit: usize,
    },

    /// Store or transaction failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Replication control failure.
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// Replication is not running on this server.
    #[error("replication is not enabled")]
    ReplicationDisabled,

    /// Body could not be decoded.
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Shorthand for [`ServerError::InvalidRequest`].
    pub fn invalid(message: impl Into<String>) -> Self {
        ServerError::InvalidRequest(message.into())
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Json(_) => 400,
            ServerError::RouteNotFound { .. } => 404,
            ServerError::PayloadTooLarge { .. } => 413,
            ServerError::Core(e) => core_status(e),
            ServerError::Replication(e) => match e {
                ReplicationError::UnknownLink { .. } => 404,
                ReplicationError::Apply { source, .. } | ReplicationError::Core(source) => {
                    core_status(source)
                }
                ReplicationError::ClusterClosed | ReplicationError::ShuttingDown => 503,
                ReplicationError::NoRuntime => 500,
            },
            ServerError::ReplicationDisabled => 503,
            ServerError::Io(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }

    /// Short name of the error kind, as shown in request logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Json(_) => "ValidationError",
            ServerError::RouteNotFound { .. } => "NotFound",
            ServerError::PayloadTooLarge { .. } => "PayloadTooLarge",
            ServerError::Core(e) => e.kind(),
            ServerError::Replication(ReplicationError::Apply { source, .. })
            | ServerError::Replication(ReplicationError::Core(source)) => source.kind(),
            ServerError::Replication(ReplicationError::UnknownLink { .. }) => "UnknownNode",
            ServerError::Replication(_) | ServerError::ReplicationDisabled => "NetworkError",
            ServerError::Io(_) => "IoError",
        }
    }
}

fn core_status(error: &CoreError) -> u16 {
    match error {
        CoreError::Validation { .. } | CoreError::InvalidOperation { .. } => 400,
        CoreError::NotFound { .. }
        | CoreError::UnknownNode { .. }
        | CoreError::TransactionNotFound { .. } => 404,
        CoreError::DuplicateKey { .. }
        | CoreError::WriteConflict { .. }
        | CoreError::SerializationConflict { .. }
        | CoreError::SequenceGap { .. } => 409,
        CoreError::NodeUnavailable { .. } => 503,
        CoreError::Io(_) | CoreError::Encoding(_) => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use akadb_core::{NodeId, RecordKey, TransactionId};

    #[test]
    fn error_classification() {
        assert!(ServerError::invalid("bad").is_client_error());
        assert!(ServerError::Io(std::io::Error::other("disk")).is_server_error());
        assert!(!ServerError::invalid("bad").is_server_error());
    }

    #[test]
    fn core_errors_map_to_status() {
        let node = NodeId::CENTRAL;
        let cases = [
            (CoreError::validation("x"), 400),
            (CoreError::not_found(node, "tt1"), 404),
            (
                CoreError::DuplicateKey {
                    node,
                    key: RecordKey::new("tt1", 1),
                },
                409,
            ),
            (
                CoreError::SerializationConflict {
                    txn: TransactionId::new(1),
                    key: RecordKey::new("tt1", 1),
                },
                409,
            ),
            (CoreError::NodeUnavailable { node }, 503),
        ];
        for (error, status) in cases {
            assert_eq!(ServerError::from(error).status_code(), status);
        }
    }

    #[test]
    fn replication_errors_map_to_status() {
        let node = NodeId::new(2).unwrap();
        assert_eq!(
            ServerError::from(ReplicationError::UnknownLink { node }).status_code(),
            404
        );
        assert_eq!(ServerError::ReplicationDisabled.status_code(), 503);
    }

    #[test]
    fn error_display() {
        let err = ServerError::RouteNotFound {
            method: "GET".into(),
            path: "/nope".into(),
        };
        assert_eq!(err.to_string(), "no route for GET /nope");
        assert_eq!(err.kind(), "NotFound");
    }
}
