//! # AkaDB Replication
//!
//! Change propagation between the nodes of an AkaDB cluster.
//!
//! This crate provides:
//! - A coordinator that fans committed changes out to peer nodes
//! - Per-destination FIFO queues with link status
//! - Retry with exponential backoff and jitter
//! - Recovery of missed changes from peers' commit logs
//! - Scheduled tasks with cancellation handles
//!
//! ## Architecture
//!
//! Commits publish a change set on the cluster's change feed. The
//! [`ReplicationCoordinator`] queues it once per destination and a tokio
//! worker per destination applies it through a [`ReplicaTarget`]. The origin's
//! commit log journals every queued, delivered, and failed change.
//!
//! ## Key Invariants
//!
//! - Changes from one origin reach a destination in commit order
//! - A replicated change commits immediately and is never re-propagated
//! - Applying the same change twice is a no-op
//! - Commit never waits for replication

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod coordinator;
mod error;
mod queue;
mod schedule;
mod target;

pub use config::{ReplicationConfig, RetryConfig};
pub use coordinator::ReplicationCoordinator;
pub use error::{ReplicationError, ReplicationResult};
pub use queue::{LinkState, LinkStatus};
pub use schedule::{ScheduledTask, TaskHandle};
pub use target::{FaultInjector, LocalReplica, ReplicaTarget};
