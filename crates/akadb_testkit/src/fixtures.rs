//! Test fixtures and cluster helpers.
//!
//! Provides convenience functions for setting up test clusters and sample
//! records.

use akadb_core::{Cluster, Config, NodeId, Operation, Record};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A test cluster with automatic cleanup.
pub struct TestCluster {
    /// The cluster instance.
    pub cluster: Cluster,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestCluster {
    /// Creates an in-memory cluster with `nodes` nodes.
    pub fn memory(nodes: u8) -> Self {
        Self {
            cluster: Cluster::in_memory(nodes).expect("Failed to open in-memory cluster"),
            temp_dir: None,
        }
    }

    /// Creates a cluster whose commit logs live in a temporary directory.
    pub fn file(nodes: u8) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let cluster = Cluster::open(Config::new().node_count(nodes).data_dir(temp_dir.path()))
            .expect("Failed to open file cluster");
        Self {
            cluster,
            temp_dir: Some(temp_dir),
        }
    }

    /// Creates an in-memory cluster with [`sample_records`] committed on the
    /// central node only.
    pub fn seeded(nodes: u8) -> Self {
        let test = Self::memory(nodes);
        seed(&test.cluster, NodeId::CENTRAL, &sample_records());
        test
    }

    /// Data directory, if file-based.
    pub fn data_dir(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// Reopens the cluster from its data directory.
    ///
    /// Panics for in-memory clusters.
    pub fn reopen(self) -> Self {
        let temp_dir = self.temp_dir.expect("Only file clusters can be reopened");
        let nodes = self.cluster.node_ids().len() as u8;
        drop(self.cluster);
        let cluster = Cluster::open(Config::new().node_count(nodes).data_dir(temp_dir.path()))
            .expect("Failed to reopen cluster");
        Self {
            cluster,
            temp_dir: Some(temp_dir),
        }
    }

    /// Path of a node's commit log, if file-based.
    pub fn log_path(&self, node: NodeId) -> Option<PathBuf> {
        self.data_dir()
            .map(|dir| dir.join(format!("{}.log", node.key())))
    }
}

impl std::ops::Deref for TestCluster {
    type Target = Cluster;

    fn deref(&self) -> &Self::Target {
        &self.cluster
    }
}

/// Shorthand for a node id known to be valid.
pub fn node(n: u8) -> NodeId {
    NodeId::new(n).expect("Invalid node number")
}

/// A record with fixed language and type.
pub fn record(title_id: &str, ordering: i32, title: &str, region: &str) -> Record {
    Record::new(title_id, ordering, title, region, "en", "movie")
}

/// A small, varied set of records.
pub fn sample_records() -> Vec<Record> {
    vec![
        Record::new("tt0000001", 1, "Carmencita", "US", "en", "imdbDisplay").original(true),
        Record::new("tt0000001", 2, "Carmencita - spanyol tánc", "HU", "hu", "imdbDisplay"),
        Record::new("tt0000002", 1, "Le clown et ses chiens", "FR", "fr", "original")
            .with_attributes("literal title"),
    ]
}

/// Commits each record in its own auto-commit transaction.
pub fn seed(cluster: &Cluster, node: NodeId, records: &[Record]) {
    for record in records {
        let txn = cluster
            .begin_with(
                node,
                cluster.settings().isolation_level,
                akadb_core::CommitMode::AutoCommit,
            )
            .expect("Failed to begin seed transaction");
        cluster
            .execute(txn, &Operation::Insert(record.clone()))
            .expect("Failed to insert seed record");
        cluster.commit(txn).expect("Failed to commit seed record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use akadb_core::RecordQuery;

    #[test]
    fn seeded_cluster_has_rows_on_central_only() {
        let test = TestCluster::seeded(3);
        let central = test.query(NodeId::CENTRAL, None, &RecordQuery::default()).unwrap();
        assert_eq!(central.total, 3);
        let regional = test.query(node(2), None, &RecordQuery::default()).unwrap();
        assert_eq!(regional.total, 0);
    }

    #[test]
    fn file_cluster_reopens() {
        let test = TestCluster::file(2);
        seed(&test, node(2), &sample_records()[..1]);
        assert!(test.log_path(node(2)).unwrap().exists());

        let test = test.reopen();
        assert_eq!(test.node(node(2)).unwrap().store().row_count(), 1);
    }
}
