//! Model-checking harness.
//!
//! Tracks what a node should contain while a test drives it, and verifies
//! the node (or any other node, after replication) against that model.

use akadb_core::{Cluster, NodeId, Operation, Record, RecordKey, RecordPatch, RecordQuery};
use std::collections::BTreeMap;

/// Drives auto-commit mutations on one node and mirrors them in a model.
pub struct ModelHarness<'a> {
    cluster: &'a Cluster,
    node: NodeId,
    expected: BTreeMap<RecordKey, Record>,
}

impl<'a> ModelHarness<'a> {
    /// Starts tracking `node`, assumed empty.
    pub fn new(cluster: &'a Cluster, node: NodeId) -> Self {
        Self {
            cluster,
            node,
            expected: BTreeMap::new(),
        }
    }

    /// Inserts a record; returns whether the insert succeeded.
    pub fn insert(&mut self, record: Record) -> bool {
        let ok = self
            .cluster
            .submit(self.node, None, &Operation::Insert(record.clone()))
            .is_ok();
        assert_eq!(
            ok,
            !self.expected.contains_key(&record.key()),
            "insert outcome disagrees with model for {}",
            record.key()
        );
        if ok {
            self.expected.insert(record.key(), record);
        }
        ok
    }

    /// Updates a record; returns whether the update succeeded.
    pub fn update(&mut self, key: RecordKey, patch: RecordPatch) -> bool {
        let op = Operation::Update {
            key: key.clone(),
            patch: patch.clone(),
        };
        let ok = self.cluster.submit(self.node, None, &op).is_ok();
        assert_eq!(ok, self.expected.contains_key(&key), "update outcome disagrees for {key}");
        if let Some(current) = self.expected.get_mut(&key) {
            *current = patch.apply(current);
        }
        ok
    }

    /// Deletes every ordering of a title; returns whether any row existed.
    pub fn delete(&mut self, title_id: &str) -> bool {
        let op = Operation::Delete {
            title_id: title_id.to_string(),
        };
        let ok = self.cluster.submit(self.node, None, &op).is_ok();
        let before = self.expected.len();
        self.expected.retain(|key, _| key.title_id != title_id);
        assert_eq!(ok, before != self.expected.len(), "delete outcome disagrees for {title_id}");
        ok
    }

    /// Verifies `node` holds exactly the model's records.
    pub fn verify(&self, node: NodeId) {
        let query = RecordQuery::default()
            .with_pagination(akadb_core::Pagination::offset(0, self.cluster.config().max_page_limit));
        let actual = self
            .cluster
            .query(node, None, &query)
            .expect("Failed to read node");
        let actual: BTreeMap<RecordKey, Record> =
            actual.data.into_iter().map(|r| (r.key(), r)).collect();
        assert_eq!(actual, self.expected, "{node} differs from the model");
    }

    /// Records the model expects.
    pub fn expected(&self) -> impl Iterator<Item = &Record> {
        self.expected.values()
    }

    /// Number of records the model expects.
    pub fn tracked_count(&self) -> usize {
        self.expected.len()
    }
}
