//! # AkaDB Server
//!
//! JSON-over-HTTP front end for an AkaDB cluster.
//!
//! This crate provides:
//! - Record CRUD, filtered listing, and grouped reports per node
//! - Isolation level and commit mode settings
//! - Manual transaction control (begin, commit, abort)
//! - Node status probes, node state changes, and replication control
//!
//! # Architecture
//!
//! The server is a thin layer over [`akadb_core::Cluster`]:
//! - [`AkaServer`] serves HTTP/1.1 with hyper and converts to [`http`] types
//!   at the socket edge
//! - [`Router`] maps method and path onto a [`RequestHandler`] method
//!
//! The server accepts connections until its shutdown future completes.
//!
//! Requests that name no node go to the configured local node.
//!
//! # Errors
//!
//! Failures are answered with `{error, kind, logs}` and a status code:
//! 400 for validation, 404 for unknown rows, nodes, transactions, or routes,
//! 409 for conflicts, 503 for unavailable nodes, 500 otherwise.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
pub mod http;
mod router;
mod server;
mod status;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{
    BeginResponse, DeleteRequest, HandlerContext, InsertRequest, LogResponse, LogsResponse,
    MoviesQuery, NodeRequest, NodeStateRequest, ReportResponse, RequestHandler, ResolveRequest,
    SettingsRequest, SimulateRequest, TransactionsResponse, UpdateRequest,
};
pub use router::Router;
pub use server::AkaServer;
pub use status::{NodeState, NodeStatus, StatusReport};
