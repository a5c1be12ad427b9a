//! Cluster nodes.

use crate::error::{CoreError, CoreResult};
use crate::stats::ClusterStats;
use crate::store::RecordStore;
use crate::transaction::TransactionManager;
use crate::types::NodeId;
use crate::wal::CommitLog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One node: a store, its commit log and its transaction manager.
///
/// A node can be taken offline administratively. Offline nodes refuse every
/// operation with [`CoreError::NodeUnavailable`] but keep their data.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    online: AtomicBool,
    manager: TransactionManager,
}

impl Node {
    /// Opens a node, replaying `log` into a fresh store.
    pub fn open(id: NodeId, log: CommitLog, stats: Arc<ClusterStats>) -> CoreResult<Self> {
        let manager = TransactionManager::recover(id, Arc::new(log), stats)?;
        Ok(Self {
            id,
            online: AtomicBool::new(true),
            manager,
        })
    }

    /// Node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node's transaction manager.
    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// The node's store.
    pub fn store(&self) -> &RecordStore {
        self.manager.store()
    }

    /// The node's commit log.
    pub fn log(&self) -> &Arc<CommitLog> {
        self.manager.log()
    }

    /// Whether the node is administratively online.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Sets the administrative state, returning the previous one.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            tracing::info!(node = %self.id, online, "node state changed");
        }
        previous
    }

    /// Fails with [`CoreError::NodeUnavailable`] if the node is offline.
    pub fn ensure_online(&self) -> CoreResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(CoreError::NodeUnavailable { node: self.id })
        }
    }

    /// Liveness probe: online and the store answers within `timeout`.
    pub fn ping(&self, timeout: Duration) -> bool {
        self.is_online() && self.store().probe(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node {
        Node::open(
            NodeId::new(2).unwrap(),
            CommitLog::in_memory(),
            Arc::new(ClusterStats::new()),
        )
        .unwrap()
    }

    #[test]
    fn offline_node_refuses_work() {
        let node = node();
        assert!(node.ensure_online().is_ok());
        assert!(node.ping(Duration::from_millis(50)));

        assert!(node.set_online(false));
        assert!(matches!(
            node.ensure_online(),
            Err(CoreError::NodeUnavailable { .. })
        ));
        assert!(!node.ping(Duration::from_millis(50)));
    }

    #[test]
    fn fresh_node_is_empty() {
        let node = node();
        assert_eq!(node.store().row_count(), 0);
        assert!(node.store().last_update().is_none());
        assert_eq!(node.manager().node(), node.id());
    }
}
