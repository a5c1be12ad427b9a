//! # AkaDB Core
//!
//! Multi-node transactional record store.
//!
//! This crate provides:
//! - Multi-version record store per node
//! - Transactions with four isolation levels and two commit modes
//! - Per-node commit log for durability and replication recovery
//! - Filtered, paginated reads and grouped reports
//! - The [`Cluster`] façade routing requests to nodes
//!
//! ## Architecture
//!
//! Every node holds an independent copy of the record table. A transaction
//! runs on exactly one node; when it commits, the node logs the change,
//! installs it, and publishes a [`ChangeSet`] on the cluster's change feed.
//! Replication to the other nodes subscribes to that feed and lives in a
//! separate crate.
//!
//! ## Key Invariants
//!
//! - `(titleId, ordering)` is unique within a node
//! - A change is logged before it becomes visible
//! - Open transactions keep the settings they started with
//! - Replicated changes apply at most once per destination

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod change;
mod cluster;
mod config;
mod error;
mod node;
mod query;
mod record;
mod report;
mod settings;
mod simulation;
mod stats;
mod store;
mod transaction;
mod types;
mod wal;

pub use change::{ChangeFeed, ChangeOp, ChangeSet, CommitListener};
pub use cluster::Cluster;
pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use node::Node;
pub use query::{Pagination, QueryResult, RecordFilter, RecordQuery, DEFAULT_PAGE_LIMIT};
pub use record::{bool_as_int, Record, RecordKey, RecordPatch, DEFAULT_ATTRIBUTES};
pub use report::{Report, ReportKind, ReportRow};
pub use settings::{Settings, SettingsHandle};
pub use simulation::SimulationReport;
pub use stats::{ClusterStats, StatsSnapshot};
pub use store::{Overlay, ReadPoint, RecordStore};
pub use transaction::{
    ApplyOutcome, CommitOutcome, Operation, PendingWrite, Transaction, TransactionInfo,
    TransactionManager, TransactionState,
};
pub use types::{CommitMode, IsolationLevel, NodeId, SequenceNumber, TransactionId};
pub use wal::{CommitLog, LogEntry, LogKind};
