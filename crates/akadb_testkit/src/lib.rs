//! # AkaDB Testkit
//!
//! Test utilities for AkaDB.
//!
//! This crate provides:
//! - Cluster fixtures, in memory or backed by a temporary directory
//! - Sample title records
//! - Property-based test generators using proptest
//! - A model harness that checks a node against expected contents
//!
//! ## Usage
//!
//! ```rust,ignore
//! use akadb_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_cluster() {
//!     let cluster = TestCluster::seeded(3);
//!     assert_eq!(cluster.node(NodeId::CENTRAL).unwrap().store().row_count(), 3);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use akadb_core::{
        Cluster, CoreError, IsolationLevel, NodeId, Operation, Record, RecordKey, RecordPatch,
        RecordQuery, Settings,
    };
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;
