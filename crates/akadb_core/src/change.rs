//! Committed change sets and commit listeners.
//!
//! Every local commit produces a [`ChangeSet`]: the after-images of the
//! transaction's writes in the order they were made. Change sets are what the
//! commit log stores and what replication ships between nodes.
//!
//! Listeners registered on a [`ChangeFeed`] are called once the commit is
//! visible, while the origin node's manager lock is still held. Changes from
//! one origin therefore reach listeners in origin sequence order. Listeners
//! must return quickly and must not call back into the committing node.

use crate::record::{Record, RecordKey};
use crate::types::{NodeId, SequenceNumber, TransactionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// One write inside a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ChangeOp {
    /// Insert or replace a record.
    Put {
        /// Full after-image.
        record: Record,
    },
    /// Remove a record.
    Delete {
        /// Key of the removed record.
        key: RecordKey,
    },
}

impl ChangeOp {
    /// Key touched by the operation.
    pub fn key(&self) -> RecordKey {
        match self {
            ChangeOp::Put { record } => record.key(),
            ChangeOp::Delete { key } => key.clone(),
        }
    }
}

/// The committed writes of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    /// Globally unique change id.
    pub change_id: Uuid,
    /// Node where the transaction committed.
    pub origin: NodeId,
    /// Position among the origin node's local commits, starting at 1 with no gaps.
    pub origin_seq: SequenceNumber,
    /// Committing transaction.
    pub txn_id: TransactionId,
    /// Commit time in epoch milliseconds.
    pub committed_at: u64,
    /// Writes in application order.
    pub ops: Vec<ChangeOp>,
}

impl ChangeSet {
    /// Creates a change set with a fresh id.
    pub fn new(
        origin: NodeId,
        origin_seq: SequenceNumber,
        txn_id: TransactionId,
        committed_at: u64,
        ops: Vec<ChangeOp>,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4(),
            origin,
            origin_seq,
            txn_id,
            committed_at,
            ops,
        }
    }

    /// Number of writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the change carries no writes.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Receives change sets after a local commit.
pub trait CommitListener: Send + Sync {
    /// Called once per committed, non-empty change set, in origin sequence
    /// order per origin.
    fn on_commit(&self, change: &ChangeSet);
}

/// Registry of commit listeners.
#[derive(Default)]
pub struct ChangeFeed {
    listeners: RwLock<Vec<Arc<dyn CommitListener>>>,
}

impl ChangeFeed {
    /// Creates an empty feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn subscribe(&self, listener: Arc<dyn CommitListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Delivers a change to every listener.
    pub fn emit(&self, change: &ChangeSet) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_commit(change);
        }
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collecting(Mutex<Vec<SequenceNumber>>);

    impl CommitListener for Collecting {
        fn on_commit(&self, change: &ChangeSet) {
            self.0.lock().push(change.origin_seq);
        }
    }

    fn change(seq: u64) -> ChangeSet {
        ChangeSet::new(
            NodeId::CENTRAL,
            SequenceNumber::new(seq),
            TransactionId::new(seq),
            0,
            vec![ChangeOp::Delete {
                key: RecordKey::new("tt1", 1),
            }],
        )
    }

    #[test]
    fn feed_delivers_in_order() {
        let feed = ChangeFeed::new();
        let sink = Arc::new(Collecting::default());
        feed.subscribe(sink.clone());

        feed.emit(&change(1));
        feed.emit(&change(2));

        assert_eq!(
            *sink.0.lock(),
            vec![SequenceNumber::new(1), SequenceNumber::new(2)]
        );
    }

    #[test]
    fn change_ids_are_unique() {
        assert_ne!(change(1).change_id, change(1).change_id);
    }

    #[test]
    fn change_set_roundtrips_through_json() {
        let original = change(7);
        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains("\"op\":\"delete\""));
        let decoded: ChangeSet = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }
}
